//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(ClusterBenchError)` on parser failure.
///
/// Example:
/// ```no_run
/// # use clusterbench::{parsed_config, ClusterBenchError};
/// # #[derive(Default)]
/// # struct MyConfig { timeout_s: u64, drain_ms: u64 }
/// # fn main() -> Result<(), ClusterBenchError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => MyConfig; timeout_s, drain_ms)?;
/// # let _ = (config.timeout_s, config.drain_ms);
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::ClusterBenchError> {
            let mut config: $config_type = Default::default();
            let mut table = match config_str {
                Some(s) => s.parse::<toml::Table>()?,
                None => return Ok(config),
            };

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::ClusterBenchError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
