use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgError, Result};
use crate::types::Geometry;

/// Filesystem layout section of the configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeometryConfig {
    /// Block size in bytes.
    pub block_size: u32,
    /// Blocks per allocation group.
    pub ag_blocks: u32,
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Length of the static header region at the start of each AG.
    pub ag_header_blocks: u32,
    /// Realtime device size in blocks; zero when there is none.
    pub rt_blocks: u64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            ag_blocks: 65536,
            ag_count: 4,
            ag_header_blocks: 4,
            rt_blocks: 0,
        }
    }
}

/// On-disk feature set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Features {
    /// Maintain the reverse-map index.
    pub rmapbt: bool,
    /// Reverse-map btree nodes carry full (start, owner, offset) keys.
    pub rmap_owner_keys: bool,
    /// Maintain the reference-count index (shared extents, CoW).
    pub reflink: bool,
    /// Maintain an inode-rooted reverse map for the realtime device.
    pub realtime_rmap: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            rmapbt: true,
            rmap_owner_keys: true,
            reflink: true,
            realtime_rmap: false,
        }
    }
}

/// Configuration supplied when creating or mounting a filesystem session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountOptions {
    /// Layout.
    pub geometry: GeometryConfig,
    /// Enabled features.
    pub features: Features,
    /// Filesystem UUID as 32 hex digits; all zero when unset.
    pub uuid: Option<String>,
    /// Debug knob: report every queried range as shared.
    pub always_cow: bool,
    /// Check that implied refcount-1 gaps have a reverse-map owner before
    /// freeing them.
    pub cross_check_implied_owners: bool,
    /// Overrides the absolute floor used by the reservation critical test.
    pub critical_floor: Option<u32>,
    /// Inode number rooting the realtime reverse-map index.
    pub rt_rmap_inode: u64,
    /// `EnvFilter` directive for [`crate::logging::init_logging`].
    pub log_filter: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            geometry: GeometryConfig::default(),
            features: Features::default(),
            uuid: None,
            always_cow: false,
            cross_check_implied_owners: true,
            critical_floor: None,
            rt_rmap_inode: 131,
            log_filter: "info".to_string(),
        }
    }
}

impl MountOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size.
    pub fn block_size(mut self, bytes: u32) -> Self {
        self.geometry.block_size = bytes;
        self
    }

    /// Sets the allocation group size and count.
    pub fn ags(mut self, ag_blocks: u32, ag_count: u32) -> Self {
        self.geometry.ag_blocks = ag_blocks;
        self.geometry.ag_count = ag_count;
        self
    }

    /// Sets the length of the static header region of each AG.
    pub fn ag_header_blocks(mut self, blocks: u32) -> Self {
        self.geometry.ag_header_blocks = blocks;
        self
    }

    /// Adds a realtime device with an inode-rooted reverse map.
    pub fn realtime(mut self, rt_blocks: u64) -> Self {
        self.geometry.rt_blocks = rt_blocks;
        self.features.realtime_rmap = rt_blocks > 0;
        self
    }

    /// Enables or disables the reverse-map index. Disabling it also turns
    /// off owner keys.
    pub fn rmapbt(mut self, enabled: bool) -> Self {
        self.features.rmapbt = enabled;
        self.features.rmap_owner_keys &= enabled;
        self
    }

    /// Selects full-key reverse-map btree nodes.
    pub fn rmap_owner_keys(mut self, enabled: bool) -> Self {
        self.features.rmap_owner_keys = enabled;
        self
    }

    /// Enables or disables the reference-count index.
    pub fn reflink(mut self, enabled: bool) -> Self {
        self.features.reflink = enabled;
        self
    }

    /// Sets the filesystem UUID (32 hex digits).
    pub fn uuid(mut self, hex_uuid: impl Into<String>) -> Self {
        self.uuid = Some(hex_uuid.into());
        self
    }

    /// Forces every shared-extent query to report sharing.
    pub fn always_cow(mut self, enabled: bool) -> Self {
        self.always_cow = enabled;
        self
    }

    /// Toggles the reverse-map cross-check of implied refcount-1 gaps.
    pub fn cross_check_implied_owners(mut self, enabled: bool) -> Self {
        self.cross_check_implied_owners = enabled;
        self
    }

    /// Overrides the reservation critical floor.
    pub fn critical_floor(mut self, blocks: u32) -> Self {
        self.critical_floor = Some(blocks);
        self
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: MountOptions =
            toml::from_str(text).map_err(|e| AgError::Config(format!("invalid TOML: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AgError::Config(format!("cannot encode TOML: {e}")))
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.to_geometry()?;
        self.uuid_bytes()?;
        if self.features.rmap_owner_keys && !self.features.rmapbt {
            return Err(AgError::Config(
                "rmap_owner_keys requires the rmapbt feature".into(),
            ));
        }
        if self.features.realtime_rmap {
            if self.geometry.rt_blocks == 0 {
                return Err(AgError::Config(
                    "realtime_rmap requires a realtime device (rt_blocks > 0)".into(),
                ));
            }
            if !self.features.rmapbt {
                return Err(AgError::Config(
                    "realtime_rmap requires the rmapbt feature".into(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the validated geometry.
    pub fn to_geometry(&self) -> Result<Geometry> {
        let g = &self.geometry;
        Geometry::new(g.block_size, g.ag_blocks, g.ag_count)
            .and_then(|geo| geo.with_header_blocks(g.ag_header_blocks))
            .map(|geo| geo.with_rt_blocks(g.rt_blocks))
            .map_err(|e| AgError::Config(format!("geometry: {e}")))
    }

    /// Decodes the UUID.
    pub fn uuid_bytes(&self) -> Result<[u8; 16]> {
        let mut out = [0u8; 16];
        if let Some(text) = &self.uuid {
            let cleaned: String = text.chars().filter(|c| *c != '-').collect();
            hex::decode_to_slice(&cleaned, &mut out)
                .map_err(|e| AgError::Config(format!("uuid: {e}")))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let opts = MountOptions::new();
        opts.validate().expect("defaults are valid");
        assert_eq!(opts.uuid_bytes().expect("uuid"), [0u8; 16]);
    }

    #[test]
    fn parses_partial_toml() {
        let opts = MountOptions::from_toml_str(
            r#"
            uuid = "00112233-4455-6677-8899-aabbccddeeff"
            always_cow = true

            [geometry]
            block_size = 1024
            ag_blocks = 4096
            ag_count = 2

            [features]
            reflink = false
            "#,
        )
        .expect("parse");
        assert_eq!(opts.geometry.block_size, 1024);
        assert_eq!(opts.geometry.ag_header_blocks, 4);
        assert!(!opts.features.reflink);
        assert!(opts.features.rmapbt);
        assert!(opts.always_cow);
        assert_eq!(opts.uuid_bytes().expect("uuid")[15], 0xff);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_geometry() {
        assert!(matches!(
            MountOptions::from_toml_str("bogus = 1"),
            Err(AgError::Config(_))
        ));
        assert!(matches!(
            MountOptions::from_toml_str("[geometry]\nblock_size = 3000"),
            Err(AgError::Config(_))
        ));
        assert!(matches!(
            MountOptions::from_toml_str("uuid = \"xyz\""),
            Err(AgError::Config(_))
        ));
    }

    #[test]
    fn feature_dependencies_are_checked() {
        let opts = MountOptions::new().rmapbt(false).rmap_owner_keys(true);
        assert!(opts.validate().is_err());
        let opts = MountOptions::new().rmapbt(false);
        assert!(!opts.features.rmap_owner_keys);
        assert!(opts.validate().is_ok());
        let mut opts = MountOptions::new();
        opts.features.realtime_rmap = true;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn loads_from_file_and_roundtrips() {
        let opts = MountOptions::new().ags(2048, 3).block_size(2048).realtime(4096);
        let text = opts.to_toml_string().expect("encode");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(text.as_bytes()).expect("write");
        let loaded = MountOptions::load(file.path()).expect("load");
        assert_eq!(loaded, opts);
        let geo = loaded.to_geometry().expect("geometry");
        assert_eq!(geo.rt_blocks, 4096);
        assert_eq!(geo.ag_count, 3);
    }
}
