use std::fmt;

#[inline(always)]
pub const fn round_up(x: usize, n: usize) -> usize {
    round_down(x + n - 1, n)
}

#[inline(always)]
pub const fn round_down(x: usize, n: usize) -> usize {
    x & !(n - 1)
}

#[inline(always)]
pub const fn is_aligned(x: usize, n: usize) -> bool {
    x & (n - 1) == 0
}

/// Parses values like `64k`, `16M`, `1g` or `4096`.
pub fn parse_size(value: &str) -> Option<usize> {
    let mut value = value.trim();
    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }
    let (digits, factor) = match value.chars().last()? {
        'g' | 'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'm' | 'M' => (&value[..value.len() - 1], 1024 * 1024),
        'k' | 'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    let number = digits.trim().parse::<f64>().ok()?;
    if number < 0.0 {
        return None;
    }
    Some((number * factor as f64) as usize)
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    std::env::var(var).ok().as_deref().and_then(parse_size)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    match read_string_from_env(var)?.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub struct FormattedSize {
    size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ksize = self.size as f64 / 1024.0;
        if ksize < 1.0 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024.0;
        if msize < 1.0 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024.0;
        if gsize < 8.0 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
