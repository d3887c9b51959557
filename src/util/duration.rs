use std::time::Duration;

/// Parses a duration written the way the engine prints them: a sequence
/// of decimal values with unit suffixes, e.g. `"1h30m"`, `"45s"`,
/// `"5m30.451s"`. A bare `"0"` is accepted and means zero.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let text = value.trim();
    if text.is_empty() {
        return Err("duration is empty".to_string());
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0.0f64;
    let mut chars = text.chars().peekable();
    let mut matched = false;

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() || *c == 'µ' {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if number.is_empty() || unit.is_empty() {
            return Err(format!("invalid duration {}", value));
        }
        let amount: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {}", value))?;
        let seconds = match unit.as_str() {
            "h" => amount * 3600.0,
            "m" => amount * 60.0,
            "s" => amount,
            "ms" => amount / 1000.0,
            "us" | "µs" => amount / 1_000_000.0,
            _ => return Err(format!("invalid duration unit {} in {}", unit, value)),
        };
        total += seconds;
        matched = true;
    }

    if !matched {
        return Err(format!("invalid duration {}", value));
    }
    // from_secs_f64 panics on out-of-range input
    if !total.is_finite() || total >= u64::MAX as f64 {
        return Err(format!("duration {} is out of range", value));
    }
    Ok(Duration::from_secs_f64(total))
}

/// Formats a duration as `1h2m3s`, truncated to whole seconds.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{}s", seconds));
    }
    out
}
