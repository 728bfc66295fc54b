//! Model size estimation: parameter count × bytes-per-weight for the quant.

use std::sync::OnceLock;

use regex::Regex;

/// Parse a parameter-count string ("7B", "70B", "0.5B", "700M") into
/// billions of parameters. Returns 0.0 when unparseable.
pub fn parse_params(params: &str) -> f64 {
    let s = params.trim();
    if s.is_empty() {
        return 0.0;
    }
    let (num, scale) = match s.chars().last() {
        Some('B') | Some('b') => (&s[..s.len() - 1], 1.0),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1.0 / 1000.0),
        _ => (s, 1.0),
    };
    num.trim().parse::<f64>().map(|v| v * scale).unwrap_or(0.0)
}

/// Approximate storage bytes per weight for a quant family. `None` when the
/// quant name carries no recognizable family.
pub fn bytes_per_weight(quant: &str) -> Option<f64> {
    let upper = quant.to_ascii_uppercase();

    if upper.contains("F32") {
        return Some(4.0);
    }
    if upper.contains("FP16") || upper.contains("BF16") || upper.contains("F16") {
        return Some(2.0);
    }

    static IQ_RE: OnceLock<Regex> = OnceLock::new();
    let iq = IQ_RE.get_or_init(|| Regex::new(r"IQ([1-4])").expect("iq regex is valid"));
    if let Some(caps) = iq.captures(&upper) {
        return match &caps[1] {
            "1" => Some(0.22),
            "2" => Some(0.32),
            "3" => Some(0.43),
            _ => Some(0.55),
        };
    }

    static Q_RE: OnceLock<Regex> = OnceLock::new();
    let q = Q_RE.get_or_init(|| Regex::new(r"Q([2-8])").expect("q regex is valid"));
    if let Some(caps) = q.captures(&upper) {
        return match &caps[1] {
            "2" => Some(0.35),
            "3" => Some(0.44),
            "4" => Some(0.56),
            "5" => Some(0.69),
            "6" => Some(0.81),
            "8" => Some(1.0),
            _ => Some(0.9),
        };
    }

    None
}

/// Estimated on-disk size in GB, or 0.0 when parameters or quant family are
/// unknown (callers fall back to the model's declared size).
pub fn estimate_quant_size_gb(params_b: f64, quant: &str) -> f64 {
    if params_b <= 0.0 {
        return 0.0;
    }
    match bytes_per_weight(quant) {
        Some(bpw) => params_b * bpw,
        None => 0.0,
    }
}
