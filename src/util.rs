//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.chars().count() <= max {
    s.to_string()
  } else {
    let head: String = s.chars().take(max).collect();
    format!("{}… ({} bytes total)", head, s.len())
  }
}

/// Pull the first numeric token out of a free-text answer, e.g.
/// "about 9.81 m/s^2" -> Some(9.81). Tolerates leading signs and commas.
pub fn leading_number(text: &str) -> Option<f64> {
  for raw in text.split_whitespace() {
    let tok: String = raw
      .chars()
      .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
      .collect();
    if tok.is_empty() {
      continue;
    }
    if let Ok(v) = tok.trim_end_matches('.').parse::<f64>() {
      return Some(v);
    }
  }
  None
}
