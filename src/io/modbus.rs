//! Modbus RTU master for the discrete I/O modules
//!
//! Protocol:
//! - RTU framing over RS485, 8N1, default 9600 baud
//! - FC 0x01 read coils, FC 0x02 read discrete inputs, FC 0x05 write single coil
//! - CRC-16 (poly 0xA001, init 0xFFFF), low byte first
//! - Exception responses set bit 7 of the function code and carry one code byte
//!
//! One port is shared by the input module and the relay module; a tokio mutex
//! serializes transactions so the poller and the output gateway never interleave
//! frames on the wire.

use crate::error::HardwareError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

const EXCEPTION_BIT: u8 = 0x80;
const REQUEST_FRAME_LEN: usize = 8;
const EXCEPTION_FRAME_LEN: usize = 5;
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Discrete input/output bus as seen by the poller and the output gateway
///
/// Input levels are raw (before polarity correction). Short reads are padded:
/// inputs with `true` (idle level for NPN sensors), coils with `false`.
#[async_trait]
pub trait DiscreteBus: Send + Sync {
    async fn read_inputs(&self) -> Result<Vec<bool>, HardwareError>;
    async fn read_coils(&self) -> Result<Vec<bool>, HardwareError>;
    async fn write_coil(&self, address: u16, on: bool) -> Result<(), HardwareError>;
    /// Release the underlying connection. Next request reconnects.
    async fn close(&self) {}
}

/// CRC-16/MODBUS
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
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

/// Build an 8-byte request: slave, function, two big-endian words, CRC
fn build_request(slave: u8, function: u8, word1: u16, word2: u16) -> [u8; REQUEST_FRAME_LEN] {
    let mut frame = [0u8; REQUEST_FRAME_LEN];
    frame[0] = slave;
    frame[1] = function;
    frame[2..4].copy_from_slice(&word1.to_be_bytes());
    frame[4..6].copy_from_slice(&word2.to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_le_bytes());
    frame
}

pub fn build_read_bits(slave: u8, function: u8, start: u16, count: u16) -> [u8; REQUEST_FRAME_LEN] {
    build_request(slave, function, start, count)
}

pub fn build_write_coil(slave: u8, address: u16, on: bool) -> [u8; REQUEST_FRAME_LEN] {
    build_request(slave, FC_WRITE_SINGLE_COIL, address, if on { COIL_ON } else { COIL_OFF })
}

/// Length of the complete response frame at the head of `buf`, once enough
/// bytes are present to tell. `None` means keep reading.
fn response_len(buf: &[u8], function: u8) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    if buf[1] == function | EXCEPTION_BIT {
        return Some(EXCEPTION_FRAME_LEN);
    }
    match function {
        FC_WRITE_SINGLE_COIL => Some(REQUEST_FRAME_LEN),
        _ => buf.get(2).map(|&byte_count| 3 + byte_count as usize + 2),
    }
}

fn check_crc(frame: &[u8]) -> Result<(), HardwareError> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let got = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != got {
        return Err(HardwareError::BadFrame(format!(
            "crc mismatch (expected {expected:04X}, got {got:04X}): {}",
            hex::encode_upper(frame)
        )));
    }
    Ok(())
}

/// Validate header and CRC common to every response frame
fn check_response(frame: &[u8], slave: u8, function: u8) -> Result<(), HardwareError> {
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(HardwareError::BadFrame(format!("short frame: {}", hex::encode_upper(frame))));
    }
    check_crc(frame)?;
    if frame[0] != slave {
        return Err(HardwareError::BadFrame(format!(
            "response from slave {} while talking to {slave}",
            frame[0]
        )));
    }
    if frame[1] == function | EXCEPTION_BIT {
        return Err(HardwareError::Exception { slave, code: frame[2] });
    }
    if frame[1] != function {
        return Err(HardwareError::BadFrame(format!(
            "function 0x{:02X} in response to 0x{function:02X}",
            frame[1]
        )));
    }
    Ok(())
}

/// Decode a read-bits response (FC01/FC02) into `count` booleans, LSB first.
/// Missing bits are filled with `pad`.
pub fn parse_bits_response(
    frame: &[u8],
    slave: u8,
    function: u8,
    count: u16,
    pad: bool,
) -> Result<Vec<bool>, HardwareError> {
    check_response(frame, slave, function)?;
    let byte_count = frame[2] as usize;
    if frame.len() != 3 + byte_count + 2 {
        return Err(HardwareError::BadFrame(format!(
            "byte count {byte_count} does not match frame length {}",
            frame.len()
        )));
    }
    let data = &frame[3..3 + byte_count];
    let mut bits: Vec<bool> = (0..count as usize)
        .take(byte_count * 8)
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect();
    if bits.len() < count as usize {
        debug!(got = bits.len(), expected = count, "modbus_short_read_padded");
        bits.resize(count as usize, pad);
    }
    Ok(bits)
}

/// Validate the echo of a write-single-coil request
pub fn parse_write_response(
    frame: &[u8],
    request: &[u8; REQUEST_FRAME_LEN],
) -> Result<(), HardwareError> {
    check_response(frame, request[0], FC_WRITE_SINGLE_COIL)?;
    if frame != request.as_slice() {
        return Err(HardwareError::BadFrame(format!(
            "write echo mismatch: {}",
            hex::encode_upper(frame)
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ModbusSettings {
    pub device: String,
    pub baud: u32,
    pub timeout: Duration,
    pub inputs_slave: u8,
    pub outputs_slave: u8,
    pub input_count: u16,
    pub coil_count: u16,
}

impl ModbusSettings {
    pub fn from_config(config: &crate::infra::config::Config) -> Self {
        let m = config.modbus();
        Self {
            device: m.device.clone(),
            baud: m.baud,
            timeout: Duration::from_millis(m.timeout_ms),
            inputs_slave: m.inputs_slave,
            outputs_slave: m.outputs_slave,
            input_count: m.input_count,
            coil_count: m.coil_count,
        }
    }
}

struct Link {
    stream: SerialStream,
    /// Bytes received past the end of the previous frame
    read_buffer: Vec<u8>,
}

/// Modbus RTU master over a tokio-serial port
pub struct ModbusRtu {
    settings: ModbusSettings,
    /// Silent interval between frames (3.5 character times, at least 1.75 ms)
    frame_gap: Duration,
    link: Mutex<Option<Link>>,
}

impl ModbusRtu {
    pub fn new(settings: ModbusSettings) -> Self {
        // 11 bits per character on the wire
        let char_us = 11_000_000u64 / settings.baud.max(1) as u64;
        let frame_gap = Duration::from_micros((char_us * 35 / 10).max(1750));
        Self { settings, frame_gap, link: Mutex::new(None) }
    }

    fn open(&self) -> Result<Link, HardwareError> {
        let stream = tokio_serial::new(&self.settings.device, self.settings.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| HardwareError::PortUnavailable {
                device: self.settings.device.clone(),
                reason: e.to_string(),
            })?;
        info!(device = %self.settings.device, baud = %self.settings.baud, "modbus_port_opened");
        Ok(Link { stream, read_buffer: Vec::with_capacity(64) })
    }

    /// Send one request and collect its response frame
    async fn transact(
        &self,
        request: &[u8; REQUEST_FRAME_LEN],
    ) -> Result<Vec<u8>, HardwareError> {
        let mut guard = self.link.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let Some(link) = guard.as_mut() else {
            return Err(HardwareError::BadFrame("link unavailable".to_string()));
        };

        let slave = request[0];
        let function = request[1];

        if !link.read_buffer.is_empty() {
            debug!(discarded = link.read_buffer.len(), "modbus_stale_bytes_discarded");
            link.read_buffer.clear();
        }

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.settings.timeout,
            Self::exchange(link, request, slave, function),
        )
        .await;

        let outcome = match result {
            Ok(Ok(frame)) => {
                trace!(
                    tx = %hex::encode_upper(request),
                    rx = %hex::encode_upper(&frame),
                    rtt_us = %started.elapsed().as_micros(),
                    "modbus_frame"
                );
                Ok(frame)
            }
            Ok(Err(e)) => {
                warn!(error = %e, device = %self.settings.device, "modbus_io_error");
                // Drop the port so the next request reopens it
                *guard = None;
                Err(e)
            }
            Err(_) => {
                if let Some(link) = guard.as_mut() {
                    link.read_buffer.clear();
                }
                Err(HardwareError::Timeout { slave, function })
            }
        };

        tokio::time::sleep(self.frame_gap).await;
        outcome
    }

    async fn exchange(
        link: &mut Link,
        request: &[u8; REQUEST_FRAME_LEN],
        slave: u8,
        function: u8,
    ) -> Result<Vec<u8>, HardwareError> {
        link.stream.write_all(request).await?;

        let mut temp_buf = [0u8; 64];
        loop {
            Self::synchronize_buffer(&mut link.read_buffer, slave);
            if let Some(len) = response_len(&link.read_buffer, function) {
                if link.read_buffer.len() >= len {
                    let frame: Vec<u8> = link.read_buffer.drain(..len).collect();
                    if !link.read_buffer.is_empty() {
                        trace!(leftover = link.read_buffer.len(), "modbus_frame_leftover_bytes");
                    }
                    return Ok(frame);
                }
            }

            match link.stream.read(&mut temp_buf).await {
                Ok(0) => {}
                Ok(n) => link.read_buffer.extend_from_slice(&temp_buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Discard bytes until the buffer starts with the addressed slave id
    fn synchronize_buffer(buffer: &mut Vec<u8>, slave: u8) {
        if buffer.is_empty() || buffer[0] == slave {
            return;
        }
        match buffer.iter().position(|&b| b == slave) {
            Some(start_idx) => {
                debug!(discarded = start_idx, "modbus_sync_discarded_bytes");
                buffer.drain(..start_idx);
            }
            None => {
                debug!(discarded = buffer.len(), "modbus_sync_no_slave_byte");
                buffer.clear();
            }
        }
    }

    async fn read_bits(
        &self,
        slave: u8,
        function: u8,
        count: u16,
        pad: bool,
    ) -> Result<Vec<bool>, HardwareError> {
        let request = build_read_bits(slave, function, 0, count);
        let frame = self.transact(&request).await?;
        parse_bits_response(&frame, slave, function, count, pad)
    }
}

#[async_trait]
impl DiscreteBus for ModbusRtu {
    async fn read_inputs(&self) -> Result<Vec<bool>, HardwareError> {
        let s = &self.settings;
        self.read_bits(s.inputs_slave, FC_READ_DISCRETE_INPUTS, s.input_count, true).await
    }

    async fn read_coils(&self) -> Result<Vec<bool>, HardwareError> {
        let s = &self.settings;
        self.read_bits(s.outputs_slave, FC_READ_COILS, s.coil_count, false).await
    }

    async fn write_coil(&self, address: u16, on: bool) -> Result<(), HardwareError> {
        let request = build_write_coil(self.settings.outputs_slave, address, on);
        let frame = self.transact(&request).await?;
        parse_write_response(&frame, &request)
    }

    async fn close(&self) {
        if self.link.lock().await.take().is_some() {
            info!(device = %self.settings.device, "modbus_port_closed");
        }
    }
}
