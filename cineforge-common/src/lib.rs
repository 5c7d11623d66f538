pub mod config;
pub mod metrics;
pub mod model;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Rendering for values that may contain secrets or oversized payloads.
///
/// Everything that ends up in logs or operator-facing messages goes through
/// `to_safe_string` instead of `Display`/`Debug`.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
