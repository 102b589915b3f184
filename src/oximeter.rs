//! CMS50D serial driver and the runtime choice between it and the simulator.
//!
//! In live mode the oximeter streams 5-byte packets at 60 Hz. Only the
//! first byte of a packet has bit 7 set, which is how the decoder finds
//! packet boundaries after connecting mid-stream.
//!
//! | byte | bits |
//! |------|------|
//! | 0 | sync (bit 7), signal strength (0-3), searching (4), beep (6) |
//! | 1 | waveform 0-127 |
//! | 2 | bar graph (0-3), finger out (4), pulse rate bit 7 (6) |
//! | 3 | pulse rate bits 0-6 |
//! | 4 | SpO2 0-100, 127 while searching |

use crate::config::DeviceConfig;
use crate::device::{LatestSample, Sample, SampleSource, SimulatedOximeter};
use crate::utils::{Clock, SystemClock};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const PACKET_LEN: usize = 5;
const SPO2_SEARCHING: u8 = 0x7f;

/// One live-mode packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivePacket {
    pub waveform: u8,
    pub pulse_rate: u16,
    pub spo2: u8,
    pub finger_out: bool,
}

impl LivePacket {
    /// Whether the packet carries a usable reading.
    pub fn is_valid(&self) -> bool {
        !self.finger_out && self.spo2 != SPO2_SEARCHING
    }
}

/// Byte-at-a-time packet framer.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: [u8; PACKET_LEN],
    len: usize,
}

impl PacketDecoder {
    pub fn push(&mut self, byte: u8) -> Option<LivePacket> {
        if byte & 0x80 != 0 {
            // a sync byte always starts over, dropping any partial packet
            self.buf[0] = byte;
            self.len = 1;
            return None;
        }
        if self.len == 0 {
            return None;
        }

        self.buf[self.len] = byte;
        self.len += 1;
        if self.len < PACKET_LEN {
            return None;
        }
        self.len = 0;

        let b = self.buf;
        Some(LivePacket {
            waveform: b[1] & 0x7f,
            pulse_rate: (((b[2] & 0x40) as u16) << 1) | (b[3] & 0x7f) as u16,
            spo2: b[4] & 0x7f,
            finger_out: b[2] & 0x10 != 0,
        })
    }
}

pub struct SerialOximeter {
    port: String,
    baud_rate: u32,
    enabled: bool,
    clock: Arc<dyn Clock>,
    latest: LatestSample,
    /// Opened by `connect`, handed to the reader by `start_live_acquisition`.
    stream: Option<SerialStream>,
    connected: bool,
    reader: Option<JoinHandle<()>>,
}

impl SerialOximeter {
    pub fn new(cfg: &DeviceConfig) -> Self {
        SerialOximeter {
            port: cfg.port.clone(),
            baud_rate: cfg.baud_rate,
            enabled: cfg.enabled,
            clock: Arc::new(SystemClock),
            latest: LatestSample::new(),
            stream: None,
            connected: false,
            reader: None,
        }
    }
}

impl SampleSource for SerialOximeter {
    async fn connect(&mut self) -> Result<()> {
        if !self.enabled {
            return Err(anyhow!("device on {} is disabled in configuration", self.port));
        }
        if self.connected {
            return Ok(());
        }
        tracing::info!("opening serial port {} at {} baud", self.port, self.baud_rate);
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .open_native_async()
            .with_context(|| format!("opening serial port {}", self.port))?;
        self.stream = Some(stream);
        self.connected = true;
        Ok(())
    }

    async fn start_live_acquisition(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow!("start_live_acquisition called before connect"))?;

        let latest = self.latest.clone();
        let clock = self.clock.clone();
        let port = self.port.clone();
        self.reader = Some(tokio::spawn(async move {
            run_serial_reader(stream, latest, clock, &port).await;
        }));
        tracing::info!("live acquisition started on {}", self.port);
        Ok(())
    }

    fn get_latest_data(&self) -> Option<Sample> {
        self.latest.latest()
    }

    async fn stop_live_acquisition(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
            tracing::info!("live acquisition stopped");
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_live_acquisition().await?;
        // the reader owned the stream; dropping either one closes the port
        self.stream = None;
        if self.connected {
            self.connected = false;
            self.latest.clear();
            tracing::info!("disconnected from {}", self.port);
        }
        Ok(())
    }
}

/// Decode packets into `latest` until the stream ends or fails.
async fn run_serial_reader<R>(mut stream: R, latest: LatestSample, clock: Arc<dyn Clock>, port: &str)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = PacketDecoder::default();
    let mut buf = [0u8; 64];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::warn!("serial port {} closed", port);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("serial read error on {}: {}", port, e);
                break;
            }
        };
        for &byte in &buf[..n] {
            let Some(packet) = decoder.push(byte) else {
                continue;
            };
            if packet.is_valid() {
                latest.publish(Sample {
                    timestamp: clock.now(),
                    pulse_rate: packet.pulse_rate,
                    spo2: packet.spo2,
                    waveform: packet.waveform,
                });
            } else {
                latest.clear();
            }
        }
    }
    // a stale reading must not outlive the device
    latest.clear();
}

/// The configured pulse source: the serial device, or the simulator when
/// explicitly requested.
pub enum Oximeter {
    Serial(SerialOximeter),
    Simulated(SimulatedOximeter),
}

impl Oximeter {
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        if cfg.simulate {
            tracing::warn!("using the simulated oximeter; recorded pulse rates are synthetic");
            Oximeter::Simulated(SimulatedOximeter::new(cfg))
        } else {
            Oximeter::Serial(SerialOximeter::new(cfg))
        }
    }
}

impl SampleSource for Oximeter {
    async fn connect(&mut self) -> Result<()> {
        match self {
            Oximeter::Serial(d) => d.connect().await,
            Oximeter::Simulated(d) => d.connect().await,
        }
    }

    async fn start_live_acquisition(&mut self) -> Result<()> {
        match self {
            Oximeter::Serial(d) => d.start_live_acquisition().await,
            Oximeter::Simulated(d) => d.start_live_acquisition().await,
        }
    }

    fn get_latest_data(&self) -> Option<Sample> {
        match self {
            Oximeter::Serial(d) => d.get_latest_data(),
            Oximeter::Simulated(d) => d.get_latest_data(),
        }
    }

    async fn stop_live_acquisition(&mut self) -> Result<()> {
        match self {
            Oximeter::Serial(d) => d.stop_live_acquisition().await,
            Oximeter::Simulated(d) => d.stop_live_acquisition().await,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self {
            Oximeter::Serial(d) => d.disconnect().await,
            Oximeter::Simulated(d) => d.disconnect().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::{base_time, SteppingClock};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const PULSE_72: [u8; 5] = [0x85, 0x40, 0x03, 0x48, 0x61];

    fn device_config(port: &str) -> DeviceConfig {
        DeviceConfig {
            enabled: true,
            simulate: false,
            port: port.to_string(),
            baud_rate: 9600,
            sample_rate_hz: 60.0,
        }
    }

    fn decode_all(bytes: &[u8]) -> Vec<LivePacket> {
        let mut decoder = PacketDecoder::default();
        bytes.iter().filter_map(|&b| decoder.push(b)).collect()
    }

    #[test]
    fn test_decode_packet() {
        let packets = decode_all(&PULSE_72);
        assert_eq!(
            packets,
            vec![LivePacket { waveform: 64, pulse_rate: 72, spo2: 97, finger_out: false }]
        );
        assert!(packets[0].is_valid());
    }

    #[test]
    fn test_pulse_rate_high_bit() {
        // 150 bpm = 0x96: bit 7 travels in byte 2
        let packets = decode_all(&[0x85, 0x10, 0x43, 0x16, 0x62]);
        assert_eq!(packets[0].pulse_rate, 150);
        assert_eq!(packets[0].spo2, 98);
    }

    #[test]
    fn test_resyncs_after_partial_packet() {
        let mut bytes = vec![0x12, 0x34, 0x85, 0x40];
        bytes.extend_from_slice(&PULSE_72);
        let packets = decode_all(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pulse_rate, 72);
    }

    #[test]
    fn test_finger_out_is_not_a_reading() {
        let packets = decode_all(&[0x80, 0x00, 0x13, 0x00, 0x7f]);
        assert!(packets[0].finger_out);
        assert!(!packets[0].is_valid());
    }

    #[tokio::test]
    async fn test_reader_publishes_and_clears_on_close() {
        let (mut device, host) = tokio::io::duplex(64);
        let latest = LatestSample::new();
        let clock: Arc<dyn Clock> =
            Arc::new(SteppingClock::new(base_time(), chrono::Duration::milliseconds(16)));
        let reader = tokio::spawn(run_serial_reader(host, latest.clone(), clock, "test"));

        device.write_all(&PULSE_72).await.unwrap();
        let mut seen = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            seen = latest.latest();
            if seen.is_some() {
                break;
            }
        }
        let sample = seen.expect("no sample decoded");
        assert_eq!(sample.pulse_rate, 72);
        assert_eq!(sample.timestamp, base_time());

        drop(device);
        reader.await.unwrap();
        assert_eq!(latest.latest(), None);
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_connect() {
        let mut device = SerialOximeter::new(&device_config("/dev/no-such-oximeter"));
        let err = device.connect().await.unwrap_err();
        assert!(format!("{:#}", err).contains("/dev/no-such-oximeter"));
        assert!(device.start_live_acquisition().await.is_err());
        device.disconnect().await.unwrap();
    }

    #[test]
    fn test_simulator_is_opt_in() {
        let mut cfg = device_config("/dev/ttyUSB0");
        assert!(matches!(Oximeter::from_config(&cfg), Oximeter::Serial(_)));
        cfg.simulate = true;
        assert!(matches!(Oximeter::from_config(&cfg), Oximeter::Simulated(_)));
    }
}
