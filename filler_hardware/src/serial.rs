//! Station transport over real serial ports.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use filler_traits::{BoxError, PortOpener, SerialEndpoint};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::error::HwError;
use crate::util::port_sort_key;

/// Read timeout handed to the OS driver. Reads are only issued when bytes are
/// already buffered, so this bounds a single syscall, not a protocol wait.
const DRIVER_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,
    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,
    /// USB product ID (if USB device)
    pub pid: Option<u16>,
    /// Product name (if available)
    pub product: Option<String>,
    /// USB serial number (if available); not the station serial id
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
            serial_number: None,
        }
    }
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => tracing::warn!(error = %e, "serial port enumeration failed"),
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str()
                && (fname.starts_with("ttyACM") || fname.starts_with("ttyUSB"))
            {
                let full = format!("/dev/{fname}");
                map.entry(full.clone())
                    .or_insert_with(|| PortInfo::bare(full));
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// A station endpoint backed by an OS serial port (8N1, no flow control).
pub struct SerialPortEndpoint {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialPortEndpoint {
    pub fn open(name: &str, baud: u32) -> Result<Self, HwError> {
        let mut port = serialport::new(name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(DRIVER_READ_TIMEOUT)
            .open()?;
        // Keep DTR asserted; toggling it resets most Arduino-class boards.
        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::debug!(port = name, error = %e, "failed to assert DTR (continuing)");
        }
        tracing::debug!(port = name, baud, "serial port opened");
        Ok(Self {
            name: name.to_string(),
            port,
        })
    }
}

impl std::fmt::Debug for SerialPortEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortEndpoint")
            .field("name", &self.name)
            .finish()
    }
}

impl SerialEndpoint for SerialPortEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> Result<usize, BoxError> {
        let n = self.port.bytes_to_read().map_err(HwError::from)?;
        Ok(n as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        if buf.is_empty() || self.bytes_available()? == 0 {
            return Ok(0);
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(Box::new(HwError::Io(e))),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        self.port.write_all(bytes).map_err(HwError::Io)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BoxError> {
        self.port.flush().map_err(HwError::Io)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), BoxError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(HwError::from)?;
        Ok(())
    }
}

/// Opens real serial ports for the handshake scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialEndpoint>, BoxError> {
        Ok(Box::new(SerialPortEndpoint::open(port, baud)?))
    }
}
