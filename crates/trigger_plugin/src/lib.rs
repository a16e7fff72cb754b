pub mod message;
pub mod oauth;
pub mod plugin;
pub mod plugin_helpers;

#[cfg(feature = "test-utils")]
pub mod plugin_test_util;
