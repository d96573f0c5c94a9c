//! The shipped example configuration stays loadable and matches the defaults.

use std::path::Path;

use scan_relay::config::{ConfigLoader, RelayConfig};

#[test]
fn test_example_config_matches_defaults() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/scan-relay.example.toml");
    let config = ConfigLoader::load_from_sources(Some(&path), Some(Default::default())).unwrap();
    assert_eq!(config, RelayConfig::default());
}
