//! 128-bit UUIDs for the split GATT service.
//!
//! All split characteristics share the vendor base
//! `xxxxxxxx-0096-7d64-08fa-28e2b4ad4e64`, with the leading word selecting
//! the characteristic. Bytes are stored little-endian, as they appear on
//! air and in advertisement payloads.

/// A full 128-bit UUID in little-endian byte order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Uuid128(pub [u8; 16]);

impl Uuid128 {
    /// Build a UUID from its five textual fields
    /// (`wwwwwwww-xxxx-yyyy-zzzz-cccccccccccc`).
    pub const fn encode(w32: u32, w1: u16, w2: u16, w3: u16, w48: u64) -> Self {
        Self([
            w48 as u8,
            (w48 >> 8) as u8,
            (w48 >> 16) as u8,
            (w48 >> 24) as u8,
            (w48 >> 32) as u8,
            (w48 >> 40) as u8,
            w3 as u8,
            (w3 >> 8) as u8,
            w2 as u8,
            (w2 >> 8) as u8,
            w1 as u8,
            (w1 >> 8) as u8,
            w32 as u8,
            (w32 >> 8) as u8,
            (w32 >> 16) as u8,
            (w32 >> 24) as u8,
        ])
    }
}

const fn split_uuid(num: u32) -> Uuid128 {
    Uuid128::encode(num, 0x0096, 0x7d64, 0x08fa, 0x28e2_b4ad_4e64)
}

/// Primary split service.
pub const SPLIT_SERVICE: Uuid128 = split_uuid(0x0000_0000);

/// Key position bitmap (notify).
pub const POSITION_STATE: Uuid128 = split_uuid(0x0000_0001);

/// Behavior invocation sink (write without response).
pub const RUN_BEHAVIOR: Uuid128 = split_uuid(0x0000_0002);

/// Sensor sample stream (notify).
pub const SENSOR_STATE: Uuid128 = split_uuid(0x0000_0003);

/// Physical layout selection sink (write without response).
pub const SELECTED_LAYOUT: Uuid128 = split_uuid(0x0000_0004);

/// HID indicator state sink (write without response).
pub const HID_INDICATORS: Uuid128 = split_uuid(0x0000_0005);

/// Active layer bitmap sink (write without response).
pub const UPDATE_LAYERS: Uuid128 = split_uuid(0x0000_0006);

/// Standard Battery Level characteristic (0x2A19) under the Bluetooth base.
pub const BATTERY_LEVEL: Uuid128 =
    Uuid128::encode(0x0000_2A19, 0x0000, 0x1000, 0x8000, 0x0080_5F9B_34FB);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uuids_share_base_and_differ_in_leading_word() {
        assert_eq!(SPLIT_SERVICE.0[..12], POSITION_STATE.0[..12]);
        assert_eq!(SPLIT_SERVICE.0[12..16], [0, 0, 0, 0]);
        assert_eq!(POSITION_STATE.0[12..16], [1, 0, 0, 0]);
        assert_ne!(RUN_BEHAVIOR, POSITION_STATE);
    }

    #[test]
    fn battery_level_uses_bluetooth_base() {
        // 00002A19-0000-1000-8000-00805F9B34FB, little-endian
        assert_eq!(
            BATTERY_LEVEL.0,
            [
                0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x19,
                0x2A, 0x00, 0x00
            ]
        );
    }
}
