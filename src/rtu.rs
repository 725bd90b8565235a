/// Modbus RTU framing helpers
///
/// RTU frames carry no length prefix. A frame is `[station, function,
/// payload..., crc_lo, crc_hi]` and its end is recognised by a silence of
/// 3.5 character times on the line.

use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use log::{debug, error, warn};

use crate::dispatcher::ProtocolDispatcher;
use crate::error::ServerError;
use crate::protocol::SlaveId;
use crate::utils::format::bytes_to_hex;

/// CRC calculator for RTU (polynomial 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest frame worth inspecting: station, function and CRC
pub const MIN_RTU_FRAME_SIZE: usize = 4;

/// Calculate the CRC16 of `data`
pub fn calculate_crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check the trailing little-endian CRC of a complete frame
pub fn validate_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    received == calculate_crc16(&frame[..data_len])
}

/// Append the CRC of `core` and return the wire frame
pub fn pack_rtu(core: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(core.len() + 2);
    frame.extend_from_slice(core);
    frame.extend_from_slice(&calculate_crc16(core).to_le_bytes());
    frame
}

/// Inter-frame silence for a baud rate
///
/// 3.5 character times of 11 bits each. Above 19200 baud the gap is fixed
/// at 1.75 ms.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    let char_time_us = (11_000_000 / baud_rate) as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

/// Validate one received RTU frame and produce the wire reply
///
/// Returns `None` whenever nothing must be sent: frames too short, CRC
/// failures, malformed cores, and frames addressed to another station.
pub fn process_rtu_frame(
    frame: &[u8],
    dispatcher: &ProtocolDispatcher,
    station: Option<SlaveId>,
) -> Option<Vec<u8>> {
    if frame.len() < MIN_RTU_FRAME_SIZE {
        error!("Unknown data: {}", bytes_to_hex(frame));
        return None;
    }

    let core = &frame[..frame.len() - 2];
    if !validate_crc(frame) {
        let received = u16::from_le_bytes([frame[core.len()], frame[core.len() + 1]]);
        let err = ServerError::crc_mismatch(calculate_crc16(core), received);
        warn!("{}: {}", err, bytes_to_hex(frame));
        return None;
    }

    if !ProtocolDispatcher::is_message_legal(core) {
        error!("Malformed Modbus-RTU frame: {}", bytes_to_hex(frame));
        return None;
    }

    if let Some(expected) = station {
        if core[0] != expected {
            debug!("Station {} ignored (serving {})", core[0], expected);
            return None;
        }
    }

    match dispatcher.dispatch(core) {
        Ok(reply) => Some(pack_rtu(&reply)),
        Err(e) => {
            error!("Failed to dispatch RTU frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_pool::{DataPool, Region};
    use crate::subscription::SubscriptionRegistry;
    use std::sync::Arc;

    fn dispatcher() -> ProtocolDispatcher {
        ProtocolDispatcher::new(Arc::new(DataPool::default()), Arc::new(SubscriptionRegistry::new()))
    }

    #[test]
    fn test_crc_known_vector() {
        let frame = pack_rtu(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
        assert!(validate_crc(&frame));
    }

    #[test]
    fn test_frame_gap() {
        assert_eq!(frame_gap(9600), Duration::from_micros(1145 * 35 / 10));
        assert_eq!(frame_gap(115_200), Duration::from_micros(1_750));
    }

    #[test]
    fn test_every_single_bit_flip_rejected() {
        let d = dispatcher();
        let frame = pack_rtu(&[0x01, 0x06, 0x00, 0x05, 0x12, 0x34]);
        assert!(process_rtu_frame(&frame, &d, Some(1)).is_some());
        d.data_pool().region(Region::HoldingRegister).set_bytes(&[0, 0], 10).unwrap();

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!validate_crc(&corrupted));
                assert!(process_rtu_frame(&corrupted, &d, None).is_none());
            }
        }
        // No corrupted frame reached the data pool
        assert_eq!(
            d.data_pool().region(Region::HoldingRegister).get_bytes(10, 2).unwrap(),
            vec![0, 0]
        );
    }

    #[test]
    fn test_station_filter() {
        let d = dispatcher();
        let frame = pack_rtu(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert!(process_rtu_frame(&frame, &d, Some(5)).is_none());
        assert!(process_rtu_frame(&frame, &d, Some(7)).is_some());
        assert!(process_rtu_frame(&frame, &d, None).is_some());
    }

    #[test]
    fn test_reply_is_crc_framed() {
        let d = dispatcher();
        d.data_pool().region(Region::HoldingRegister).set_bytes(&[0x00, 0x0A, 0x00, 0x0B], 0).unwrap();
        let reply = process_rtu_frame(&pack_rtu(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), &d, Some(1)).unwrap();
        assert_eq!(reply, vec![0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B, 0x9B, 0xF6]);
    }

    #[test]
    fn test_exception_reply_over_rtu() {
        let d = dispatcher();
        let reply = process_rtu_frame(&pack_rtu(&[0x01, 0x2B, 0x0E, 0x01]), &d, Some(1)).unwrap();
        assert_eq!(&reply[..3], &[0x01, 0xAB, 0x01]);
        assert!(validate_crc(&reply));
    }

    #[test]
    fn test_malformed_core_dropped() {
        let d = dispatcher();
        assert!(process_rtu_frame(&pack_rtu(&[0x01, 0x03, 0x00, 0x00, 0x00]), &d, Some(1)).is_none());
        assert!(process_rtu_frame(&[0x01, 0x03, 0x00], &d, Some(1)).is_none());
    }
}
