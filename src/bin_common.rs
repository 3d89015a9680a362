/// Highest number of inverters one collector polls.
pub const MAX_UNITS: usize = 5;

/// Parse a Modbus unit id given in decimal or `0x` hex.
pub fn parse_address(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let unit = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|e| e.to_string())?
    } else {
        s.parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())?
    };
    if unit == 0 || unit > 247 {
        return Err(format!("unit id {unit} is outside 1..=247"));
    }
    Ok(unit)
}

/// Check the number of unit ids and reject duplicates.
pub fn check_units(units: &[u8]) -> Result<(), String> {
    if units.is_empty() || units.len() > MAX_UNITS {
        return Err(format!(
            "between 1 and {MAX_UNITS} unit ids are required, got {}",
            units.len()
        ));
    }
    for (i, unit) in units.iter().enumerate() {
        if units[..i].contains(unit) {
            return Err(format!("unit id {unit} is given twice"));
        }
    }
    Ok(())
}
