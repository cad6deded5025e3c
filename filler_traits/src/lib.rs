pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Error type crossing the hardware trait boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One open byte stream to a station microcontroller.
///
/// Implementations must never block in `bytes_available` or `read`; a read
/// returns whatever is buffered (possibly 0 bytes). Writes block until the
/// bytes have been handed to the OS.
pub trait SerialEndpoint: Send {
    /// Human-readable port name (e.g. "/dev/ttyACM0").
    fn name(&self) -> &str;
    fn bytes_available(&mut self) -> Result<usize, BoxError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError>;
    fn flush(&mut self) -> Result<(), BoxError>;
    /// Drop any bytes buffered on the input side.
    fn clear_input(&mut self) -> Result<(), BoxError>;
}

impl<T: SerialEndpoint + ?Sized> SerialEndpoint for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn bytes_available(&mut self) -> Result<usize, BoxError> {
        (**self).bytes_available()
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        (**self).read(buf)
    }
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        (**self).write_all(bytes)
    }
    fn flush(&mut self) -> Result<(), BoxError> {
        (**self).flush()
    }
    fn clear_input(&mut self) -> Result<(), BoxError> {
        (**self).clear_input()
    }
}

/// Opens candidate ports by name.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialEndpoint>, BoxError>;
}
