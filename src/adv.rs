//! Advertisement payload parsing.

use crate::uuid::Uuid128;

/// Check whether raw advertisement data lists `uuid` in a 128-bit Service
/// UUID structure (AD types 0x06 incomplete / 0x07 complete).
pub fn lists_service_uuid(data: &[u8], uuid: &Uuid128) -> bool {
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        let ad_type = data[i + 1];
        if ad_type == 0x06 || ad_type == 0x07 {
            let uuid_data = &data[i + 2..i + 1 + len];
            for chunk in uuid_data.chunks_exact(16) {
                if chunk == uuid.0 {
                    return true;
                }
            }
        }
        i += len + 1;
    }
    false
}
