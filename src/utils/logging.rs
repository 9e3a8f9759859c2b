// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        // RUST_LOG wins so russh internals can be inspected
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("fleetssh=warn"),
            1 => EnvFilter::new("fleetssh=info"),
            2 => EnvFilter::new("fleetssh=debug,russh=debug"),
            _ => EnvFilter::new("fleetssh=trace,russh=trace"),
        }
    }
}

/// Install a console subscriber for embedding applications.
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_verbosity_levels() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(create_env_filter(0).to_string(), "fleetssh=warn");
        assert_eq!(create_env_filter(1).to_string(), "fleetssh=info");
        assert!(create_env_filter(2).to_string().contains("russh=debug"));
        assert!(create_env_filter(9).to_string().contains("fleetssh=trace"));
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_verbosity() {
        std::env::set_var("RUST_LOG", "fleetssh=error");
        let filter = create_env_filter(3);
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "fleetssh=error");
    }

    #[test]
    #[serial]
    fn test_init_logging_twice_is_harmless() {
        init_logging(0);
        init_logging(1);
    }
}
