//! Configuration access port trait.

/// Lookups of `section`/`key` pairs. Sections and keys are case-insensitive.
pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;

    /// `Ok(None)` when the key is absent, `Err` with a reason when the value
    /// is not an integer.
    fn get_int(&self, section: &str, key: &str) -> Result<Option<i64>, String>;
}
