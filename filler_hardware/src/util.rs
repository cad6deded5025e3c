/// Sort key for port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
pub fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Names that look like USB CDC / FTDI station adapters.
pub fn is_station_candidate(name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    basename.starts_with("ttyACM")
        || basename.starts_with("ttyUSB")
        || basename.starts_with("cu.usb")
        || basename.to_ascii_uppercase().starts_with("COM")
}
