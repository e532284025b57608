//! Fixed register map shared by every unit on the bus.

/// Bus addresses of the six possible units, main unit first.
pub const UNIT_ADDRESSES: [u8; 6] = [0x08, 0x10, 0x18, 0x20, 0x28, 0x30];

pub const REG_SRC_AD: u8 = 0x00;
pub const REG_ZONE321: u8 = 0x01;
pub const REG_ZONE654: u8 = 0x02;
pub const REG_MUTE: u8 = 0x03;
pub const REG_AMP_EN: u8 = 0x04;
pub const REG_VOL_ZONE_BASE: u8 = 0x05; // VOL_ZONE1..6 at 0x05..0x0A
pub const REG_POWER: u8 = 0x0B;
pub const REG_FANS: u8 = 0x0C;
pub const REG_LED_CTRL: u8 = 0x0D;
pub const REG_LED_VAL: u8 = 0x0E;
pub const REG_TEMP_BASE: u8 = 0x11; // 0x11..0x18 temps / HV voltages
pub const REG_PI_TEMP: u8 = 0x14;
pub const REG_EEPROM_REQ: u8 = 0x1F;
pub const REG_EEPROM_DATA_BASE: u8 = 0x20; // 0x20..0x2F
pub const REG_VERSION_MAJOR: u8 = 0xFA;

/// Register holding a zone's volume, `local_zone` in `0..6`.
pub fn reg_vol_zone(local_zone: u8) -> u8 {
    REG_VOL_ZONE_BASE + local_zone
}
