use std::fmt;

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Characteristic User Description descriptor (0x2901)
pub const USER_DESCRIPTION_UUID: Uuid = uuid_from_u16(0x2901);

// Uuids used as map keys and log fields are usually SIG-assigned 16-bit
// values so it's handy to be able to print them in their short form.
pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn short(&self) -> ShortUuid;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn short(&self) -> ShortUuid {
        ShortUuid(*self)
    }
}

/// Displays a Uuid as `0x2901` when it's based on the Bluetooth base Uuid and
/// in full otherwise
#[derive(Clone, Copy)]
pub struct ShortUuid(Uuid);

impl fmt::Display for ShortUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.as_u16() {
            Some(short) => write!(f, "0x{:04X}", short),
            None => write!(f, "{}", self.0),
        }
    }
}

// const so that applications can declare const Uuids for the services and
// characteristics they care about
pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

#[test]
fn user_description_uuid() {
    let expected = Uuid::parse_str("00002901-0000-1000-8000-00805F9B34FB").unwrap();
    assert_eq!(USER_DESCRIPTION_UUID, expected);
    assert_eq!(USER_DESCRIPTION_UUID.as_u16(), Some(0x2901));
    assert_eq!(USER_DESCRIPTION_UUID.short().to_string(), "0x2901");

    let custom = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
    assert_eq!(custom.as_u16(), None);
    assert_eq!(custom.short().to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
}
