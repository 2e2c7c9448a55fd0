//! Parsers for the accounting tool's unit-bearing string fields.
//!
//! Memory sizes arrive as a number with an optional `{K,M,G,T}` suffix
//! (base-10 powers of 1000 bytes); ReqMem additionally carries a `c`/`n`
//! qualifier deciding per-CPU versus per-node semantics. GPU counts are
//! embedded in the comma-separated AllocTRES string.

/// Whether a ReqMem value applies per allocated CPU or per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqMemPer {
    Cpu,
    Node,
}

/// Parses a memory size string into megabytes.
///
/// Suffixes are decimal: `K` = 10^3, `M` = 10^6, `G` = 10^9, `T` = 10^12
/// bytes. A bare number is taken as bytes. Returns `None` for empty or
/// non-numeric input; callers treat that as a zero contribution.
pub fn parse_mem_mb(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1e3),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1e6),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1e9),
        Some('T') | Some('t') => (&s[..s.len() - 1], 1e12),
        _ => (s, 1.0),
    };

    let value: f64 = num.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value * multiplier / 1e6)
}

/// Parses a ReqMem string such as `4000Mc` or `8Gn` into megabytes plus its
/// per-CPU/per-node qualifier. A value without a qualifier is per-node.
pub fn parse_req_mem(s: &str) -> Option<(f64, ReqMemPer)> {
    let s = s.trim();
    let (rest, per) = match s.chars().last() {
        Some('c') => (&s[..s.len() - 1], ReqMemPer::Cpu),
        Some('n') => (&s[..s.len() - 1], ReqMemPer::Node),
        _ => (s, ReqMemPer::Node),
    };
    parse_mem_mb(rest).map(|mb| (mb, per))
}

/// Sums the GPU counts from an AllocTRES string.
///
/// Matching tokens look like `gres/gpu=4` or `gres/gpu:a100=2`; anything else
/// (billing, cpu, mem, malformed counts) is ignored.
pub fn gpu_count(alloc_tres: &str) -> u64 {
    alloc_tres
        .split(',')
        .filter_map(|token| {
            let (key, value) = token.trim().split_once('=')?;
            if key == "gres/gpu" || key.strip_prefix("gres/gpu:").is_some() {
                value.parse::<u64>().ok()
            } else {
                None
            }
        })
        .sum()
}

/// Canonical username form: lowercase with any `@realm` suffix removed.
pub fn normalize_username(raw: &str) -> String {
    let name = raw.split('@').next().unwrap_or(raw);
    name.trim().to_ascii_lowercase()
}
