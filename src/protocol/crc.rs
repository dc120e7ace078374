//! The two CRC-16 variants used by the dongle.
//!
//! The wire framing and the UART command layer use different checksums.
//! They share the 0xFFFF seed and nothing else, so keep them apart.

/// CRC-16 protecting wire frames.
///
/// Polynomial 0x8005, seed 0xFFFF, MSB-first, no final XOR.
#[must_use]
pub fn crc16_wire(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// CRC-16 protecting UART command frames.
///
/// Reflected polynomial 0xA001, seed 0xFFFF, LSB-first, no final XOR.
#[must_use]
pub fn crc16_command(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_values() {
        let data = [0x00, 0x01, 0x02];
        assert_eq!(crc16_wire(&data), 0x880F);
        assert_eq!(crc16_command(&data), 0x91F1);
        assert_ne!(crc16_wire(&data), crc16_command(&data));
    }

    #[test]
    fn test_check_strings() {
        // Standard "123456789" check values (CRC-16/CMS and CRC-16/MODBUS).
        assert_eq!(crc16_wire(b"123456789"), 0xAEE7);
        assert_eq!(crc16_command(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(crc16_wire(&[]), 0xFFFF);
        assert_eq!(crc16_command(&[]), 0xFFFF);
    }
}
