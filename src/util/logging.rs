// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Logging utilities
//!
//! The crate logs through the `log` facade; these helpers install
//! `env_logger` as the backend for binaries and tests.

/// Initialize logging with default configuration (`RUST_LOG`)
pub fn init_logging() {
    env_logger::init();
}

/// Initialize logging with specific level
pub fn init_logging_with_level(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/// Initialize logging for tests, tolerating repeated calls
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}
