/// Request dispatcher
///
/// Executes one decoded request against the data pool and builds the reply
/// PDU. Input and output are "core" frames: `[station, function, payload...]`
/// with any transport header or checksum already removed.
///
/// ## Failure handling
///
/// Nothing raised while decoding or executing a request escapes
/// [`ProtocolDispatcher::dispatch`]: every error becomes an exception reply
/// `[station, function | 0x80, code]`. Validation problems map to codes 1-3,
/// anything unexpected to code 4 and an error log line.
///
/// ## Write notifications
///
/// Register writes are applied with a single [`AddressSpace`] call that
/// captures old and new words under the same lock. Subscribers are notified
/// only after that lock is released, one notification per changed address
/// in ascending order, so no subscriber can observe a half-applied batch.
///
/// [`AddressSpace`]: crate::address_space::AddressSpace

use std::sync::Arc;

use log::{debug, error};

use crate::data_pool::{DataPool, Region};
use crate::error::{ServerError, ServerResult};
use crate::protocol::{data_utils, ModbusException, ModbusFunction, Request, SlaveId, COIL_OFF, COIL_ON};
use crate::subscription::{RegisterChange, SubscriptionRegistry};

/// Function-code dispatch table over a shared data pool
#[derive(Debug, Clone)]
pub struct ProtocolDispatcher {
    pool: Arc<DataPool>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl ProtocolDispatcher {
    pub fn new(pool: Arc<DataPool>, subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self { pool, subscriptions }
    }

    pub fn data_pool(&self) -> &Arc<DataPool> {
        &self.pool
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Handle one request core and return the reply core
    ///
    /// The only error is a core too short to carry a station and function
    /// code, for which no reply can be addressed at all.
    pub fn dispatch(&self, core: &[u8]) -> ServerResult<Vec<u8>> {
        if core.len() < 2 {
            return Err(ServerError::frame(format!(
                "Request core too short: {} bytes",
                core.len()
            )));
        }
        let station = core[0];
        let function_code = core[1];

        let result = Request::parse(function_code, &core[2..]).and_then(|request| {
            debug!("Station {} {:?}", station, request);
            self.execute(&request)
        });

        match result {
            Ok(payload) => {
                let mut reply = Vec::with_capacity(2 + payload.len());
                reply.push(station);
                reply.push(function_code);
                reply.extend_from_slice(&payload);
                Ok(reply)
            }
            Err(e) => {
                let code = e.exception_code();
                if code == ModbusException::ServerDeviceFailure.to_u8() {
                    error!("Station {} function 0x{:02X} failed: {}", station, function_code, e);
                } else {
                    debug!("Station {} function 0x{:02X} rejected: {}", station, function_code, e);
                }
                Ok(exception_reply(station, function_code, code))
            }
        }
    }

    fn execute(&self, request: &Request) -> ServerResult<Vec<u8>> {
        match request {
            Request::ReadCoils { address, quantity } => self.read_bits(Region::Coil, *address, *quantity),
            Request::ReadDiscreteInputs { address, quantity } => {
                self.read_bits(Region::DiscreteInput, *address, *quantity)
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                self.read_registers(Region::HoldingRegister, *address, *quantity)
            }
            Request::ReadInputRegisters { address, quantity } => {
                self.read_registers(Region::InputRegister, *address, *quantity)
            }
            Request::WriteSingleCoil { address, value } => {
                self.pool
                    .region(Region::Coil)
                    .set_byte(*address as usize, *value as u8)?;
                let encoded = if *value { COIL_ON } else { COIL_OFF };
                Ok(echo(*address, encoded))
            }
            Request::WriteSingleRegister { address, value } => {
                self.write_registers(*address, &value.to_be_bytes())?;
                Ok(echo(*address, *value))
            }
            Request::WriteMultipleCoils { address, quantity, values } => {
                let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
                let written = self.pool.region(Region::Coil).set_bytes(&bytes, *address as usize)?;
                if written != bytes.len() {
                    return Err(ServerError::internal(format!(
                        "Coil write truncated: {} of {} written",
                        written,
                        bytes.len()
                    )));
                }
                Ok(echo(*address, *quantity))
            }
            Request::WriteMultipleRegisters { address, quantity, values } => {
                self.write_registers(*address, values)?;
                Ok(echo(*address, *quantity))
            }
        }
    }

    fn read_bits(&self, region: Region, address: u16, quantity: u16) -> ServerResult<Vec<u8>> {
        let points = self
            .pool
            .region(region)
            .get_bytes(address as usize, quantity as usize)?;
        let bits: Vec<bool> = points.iter().map(|&b| b != 0).collect();
        Ok(with_byte_count(data_utils::pack_bits(&bits)))
    }

    fn read_registers(&self, region: Region, address: u16, quantity: u16) -> ServerResult<Vec<u8>> {
        let unit = region.unit_size();
        let words = self
            .pool
            .region(region)
            .get_bytes(address as usize * unit, quantity as usize * unit)?;
        Ok(with_byte_count(words))
    }

    /// Apply a register batch and notify subscribers once it is complete
    fn write_registers(&self, address: u16, data: &[u8]) -> ServerResult<()> {
        let (before, after) = self
            .pool
            .region(Region::HoldingRegister)
            .replace_bytes(data, address as usize * 2)?;
        if after.len() != data.len() {
            return Err(ServerError::internal(format!(
                "Register write truncated: {} of {} bytes written",
                after.len(),
                data.len()
            )));
        }

        let changes: Vec<RegisterChange> = data_utils::bytes_to_registers(&before)
            .into_iter()
            .zip(data_utils::bytes_to_registers(&after))
            .enumerate()
            .map(|(i, (before, after))| RegisterChange {
                address: address.wrapping_add(i as u16),
                before,
                after,
            })
            .collect();

        if let Err(e) = self.subscriptions.notify(&changes) {
            error!("Failed to notify subscribers of register {}: {}", address, e);
        }
        Ok(())
    }

    /// Shape check applied to serial frames before dispatch
    ///
    /// Fixed-length functions must be exactly six bytes; multi-write
    /// functions must declare a byte count matching what follows it. Cores
    /// with other function codes pass, so they are answered with an
    /// illegal-function exception rather than dropped.
    pub fn is_message_legal(core: &[u8]) -> bool {
        if core.len() < 2 {
            return false;
        }
        match ModbusFunction::from_u8(core[1]) {
            Ok(function) if function.has_fixed_length() => core.len() == 6,
            Ok(_) => core.len() >= 7 && core[6] as usize == core.len() - 7,
            Err(_) => true,
        }
    }
}

/// Build an exception reply core
pub fn exception_reply(station: SlaveId, function_code: u8, code: u8) -> Vec<u8> {
    vec![station, function_code | 0x80, code]
}

fn echo(address: u16, value: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    payload
}

fn with_byte_count(data: Vec<u8>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(data.len() as u8);
    payload.extend(data);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn dispatcher() -> ProtocolDispatcher {
        ProtocolDispatcher::new(Arc::new(DataPool::default()), Arc::new(SubscriptionRegistry::new()))
    }

    #[test]
    fn test_read_holding_registers() {
        let d = dispatcher();
        d.data_pool()
            .region(Region::HoldingRegister)
            .set_bytes(&[0x00, 0x0A, 0x01, 0x02], 200)
            .unwrap();
        let reply = d.dispatch(&[0x01, 0x03, 0x00, 0x64, 0x00, 0x02]).unwrap();
        assert_eq!(reply, vec![0x01, 0x03, 0x04, 0x00, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn test_read_input_registers() {
        let d = dispatcher();
        d.data_pool().region(Region::InputRegister).set_bytes(&[0xAB, 0xCD], 0).unwrap();
        let reply = d.dispatch(&[0x07, 0x04, 0x00, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(reply, vec![0x07, 0x04, 0x02, 0xAB, 0xCD]);
    }

    #[test]
    fn test_read_coils_packing() {
        let d = dispatcher();
        let coils = [1u8, 0, 1, 1, 0, 0, 1, 1, 1, 0];
        d.data_pool().region(Region::Coil).set_bytes(&coils, 19).unwrap();
        let reply = d.dispatch(&[0x01, 0x01, 0x00, 0x13, 0x00, 0x0A]).unwrap();
        assert_eq!(reply, vec![0x01, 0x01, 0x02, 0xCD, 0x01]);
    }

    #[test]
    fn test_coil_round_trip_offsets() {
        let d = dispatcher();
        let pattern: Vec<bool> = (0..37).map(|i| i % 3 == 0 || i % 5 == 1).collect();
        let packed = data_utils::pack_bits(&pattern);
        let len = pattern.len() as u16;

        for offset in [0u16, 32768, (65536 - pattern.len()) as u16] {
            let mut request = vec![0x01, 0x0F];
            request.extend_from_slice(&offset.to_be_bytes());
            request.extend_from_slice(&len.to_be_bytes());
            request.push(packed.len() as u8);
            request.extend_from_slice(&packed);
            let reply = d.dispatch(&request).unwrap();
            assert_eq!(&reply[2..], &[offset.to_be_bytes()[0], offset.to_be_bytes()[1], 0x00, 37]);

            let mut read = vec![0x01, 0x01];
            read.extend_from_slice(&offset.to_be_bytes());
            read.extend_from_slice(&len.to_be_bytes());
            let reply = d.dispatch(&read).unwrap();
            assert_eq!(reply[2] as usize, packed.len());
            assert_eq!(data_utils::unpack_bits(&reply[3..], pattern.len()), pattern);
        }
    }

    #[test]
    fn test_quantity_limit_exception() {
        let d = dispatcher();
        let reply = d.dispatch(&[0x01, 0x01, 0x00, 0x00, 0x07, 0xF8]).unwrap();
        assert_eq!(reply[1], 0x01);
        assert_eq!(reply[2], 255);
        assert_eq!(reply.len(), 3 + 255);

        let reply = d.dispatch(&[0x01, 0x01, 0x00, 0x00, 0x07, 0xF9]).unwrap();
        assert_eq!(reply, vec![0x01, 0x81, 0x03]);
    }

    #[test]
    fn test_address_overflow_exception() {
        let d = dispatcher();
        let reply = d.dispatch(&[0x01, 0x03, 0xFF, 0xF0, 0x00, 0x11]).unwrap();
        assert_eq!(reply, vec![0x01, 0x83, 0x02]);
        let reply = d.dispatch(&[0x01, 0x02, 0xFF, 0xFF, 0x00, 0x02]).unwrap();
        assert_eq!(reply, vec![0x01, 0x82, 0x02]);
    }

    #[test]
    fn test_unsupported_function() {
        let d = dispatcher();
        assert_eq!(d.dispatch(&[0x11, 0x2B, 0x0E]).unwrap(), vec![0x11, 0xAB, 0x01]);
        assert!(d.dispatch(&[0x11]).is_err());
    }

    #[test]
    fn test_write_single_coil_echo() {
        let d = dispatcher();
        let request = [0x01, 0x05, 0x00, 0xAC, 0xFF, 0x00];
        assert_eq!(d.dispatch(&request).unwrap(), request.to_vec());
        assert_eq!(d.data_pool().region(Region::Coil).get_byte(0xAC).unwrap(), 1);

        let reply = d.dispatch(&[0x01, 0x05, 0x00, 0xAC, 0x00, 0x01]).unwrap();
        assert_eq!(reply, vec![0x01, 0x85, 0x03]);
        assert_eq!(d.data_pool().region(Region::Coil).get_byte(0xAC).unwrap(), 1);
    }

    #[test]
    fn test_write_single_register_echo() {
        let d = dispatcher();
        let request = [0x01, 0x06, 0x00, 0x01, 0x00, 0x03];
        assert_eq!(d.dispatch(&request).unwrap(), request.to_vec());
        assert_eq!(
            d.data_pool().region(Region::HoldingRegister).get_bytes(2, 2).unwrap(),
            vec![0x00, 0x03]
        );
    }

    #[test]
    fn test_batch_write_notifications() {
        let d = dispatcher();
        let holding = d.data_pool().region(Region::HoldingRegister);
        holding.set_bytes(&[0x00, 0x01, 0x00, 0x02, 0x00, 0x03], 20).unwrap();

        let seen: Arc<Mutex<Vec<(RegisterChange, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        for address in [10u16, 11, 12] {
            let seen = seen.clone();
            let pool = d.data_pool().clone();
            d.subscriptions()
                .subscribe(address, move |change: &RegisterChange| {
                    // Memory as seen from inside the callback
                    let state = pool.region(Region::HoldingRegister).get_bytes(20, 6).unwrap();
                    seen.lock().unwrap().push((*change, state));
                })
                .unwrap();
        }

        // A: 1 -> 7, B: 2 -> 2, C: 3 -> 9
        let reply = d
            .dispatch(&[0x01, 0x10, 0x00, 0x0A, 0x00, 0x03, 0x06, 0x00, 0x07, 0x00, 0x02, 0x00, 0x09])
            .unwrap();
        assert_eq!(reply, vec![0x01, 0x10, 0x00, 0x0A, 0x00, 0x03]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, RegisterChange { address: 10, before: 1, after: 7 });
        assert_eq!(seen[1].0, RegisterChange { address: 12, before: 3, after: 9 });
        for (_, state) in seen.iter() {
            assert_eq!(state, &vec![0x00, 0x07, 0x00, 0x02, 0x00, 0x09]);
        }
    }

    #[test]
    fn test_write_multiple_registers_byte_count_mismatch() {
        let d = dispatcher();
        let reply = d.dispatch(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(reply, vec![0x01, 0x90, 0x03]);
        assert_eq!(
            d.data_pool().region(Region::HoldingRegister).get_bytes(0, 4).unwrap(),
            vec![0; 4]
        );
    }

    #[test]
    fn test_message_legality() {
        assert!(ProtocolDispatcher::is_message_legal(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]));
        assert!(!ProtocolDispatcher::is_message_legal(&[0x01, 0x03, 0x00, 0x00, 0x00]));
        assert!(ProtocolDispatcher::is_message_legal(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x05]));
        assert!(!ProtocolDispatcher::is_message_legal(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00]));
        assert!(ProtocolDispatcher::is_message_legal(&[0x01, 0x2B, 0x0E]));
        assert!(!ProtocolDispatcher::is_message_legal(&[0x01]));
    }
}
