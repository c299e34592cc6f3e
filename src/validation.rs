use std::net::IpAddr;
use std::ops::RangeInclusive;

/// Validates a device name of the form `domain/family/member`.
///
/// # Arguments
///
/// * `name` - The device name to validate.
///
/// # Returns
///
/// * `Ok(())` if the name has three non-empty, whitespace-free parts.
/// * `Err(&'static str)` otherwise.
pub fn is_valid_device_name(name: &str) -> Result<(), &'static str> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != 3 {
        return Err("Device name must have the form domain/family/member");
    }
    if parts
        .iter()
        .any(|p| p.is_empty() || p.chars().any(char::is_whitespace))
    {
        return Err("Device name parts must be non-empty and contain no whitespace");
    }
    Ok(())
}

/// Validates if a given u16 value is a valid port number.
/// By type, the port is already within the 0-65535 range.
/// This function checks that the port is not 0, which is reserved.
pub fn is_valid_port(port: u16) -> Result<(), &'static str> {
    if port > 0 {
        Ok(())
    } else {
        Err("Port number must be greater than 0")
    }
}

/// Validates if a given string is a valid IP address.
pub fn is_valid_ip(ip: &str) -> Result<(), &'static str> {
    ip.parse::<IpAddr>().map(|_| ()).map_err(|_| "Invalid IP address")
}

/// Validates a MAC address written as six dot- or colon-separated hex octets
/// (`02.00.00.00.00.00`).
pub fn is_valid_mac(mac: &str) -> Result<(), &'static str> {
    let octets: Vec<&str> = mac.split(['.', ':']).collect();
    if octets.len() != 6 {
        return Err("MAC address must have six octets");
    }
    if octets
        .iter()
        .all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok())
    {
        Ok(())
    } else {
        Err("MAC address octets must be two hex digits")
    }
}

/// Validates if a given string is a valid file path.
///
/// # Returns
///
/// * `Ok(())` if the file path is valid.
/// * `Err(&'static str)` if the file path is empty or contains a null byte.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Validates if a given value is within a specified numeric range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is not empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}
