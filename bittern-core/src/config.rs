//! Runtime configuration: the control-message key/value surface spec.md
//! §6 names, plus the two mode enums that change engine behavior.
//!
//! There is no file-based configuration format; control messages are the
//! only configuration surface, matching the original design.

use crate::error::{Error, Result};

/// Cache mode. Writeback may acknowledge writes while still dirty in
/// cache; write-through propagates every write to the backing device
/// before acknowledging it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Writeback,
    Writethrough,
}

impl CacheMode {
    pub fn parse(s: &str) -> Result<CacheMode> {
        match s {
            "writeback" => Ok(CacheMode::Writeback),
            "writethrough" => Ok(CacheMode::Writethrough),
            other => Err(Error::InvalidArgument(format!("unknown cache_mode {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Writeback => "writeback",
            CacheMode::Writethrough => "writethrough",
        }
    }
}

/// Block-replacement policy used when allocating an invalid slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Fifo,
    Lru,
    Random,
}

impl Default for ReplacementPolicy {
    fn default() -> ReplacementPolicy {
        ReplacementPolicy::Random
    }
}

impl ReplacementPolicy {
    pub fn parse(s: &str) -> Result<ReplacementPolicy> {
        match s {
            "fifo" => Ok(ReplacementPolicy::Fifo),
            "lru" => Ok(ReplacementPolicy::Lru),
            "random" => Ok(ReplacementPolicy::Random),
            other => Err(Error::InvalidArgument(format!("unknown replacement policy {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplacementPolicy::Fifo => "fifo",
            ReplacementPolicy::Lru => "lru",
            ReplacementPolicy::Random => "random",
        }
    }
}

/// Background-writeback tunables, set as a group via
/// `bgwriter_conf_*` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgWriterConf {
    pub flush_on_exit: bool,
    pub greedyness: i32,
    pub max_queue_depth_pct: u32,
    pub cluster_size: u32,
    pub policy_standard: bool,
}

impl Default for BgWriterConf {
    fn default() -> BgWriterConf {
        BgWriterConf {
            flush_on_exit: true,
            greedyness: 0,
            max_queue_depth_pct: 100,
            cluster_size: 1,
            policy_standard: true,
        }
    }
}

/// Per-direction sequential-bypass tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BypassConf {
    pub enabled: bool,
    /// Threshold in 512-byte sectors before a stream starts bypassing.
    pub threshold_sectors: u32,
    pub timeout_ms: u32,
}

impl BypassConf {
    pub fn read_default() -> BypassConf {
        BypassConf { enabled: true, threshold_sectors: (128 * 1024) / 512, timeout_ms: 5_000 }
    }

    pub fn write_default() -> BypassConf {
        BypassConf { enabled: true, threshold_sectors: (8_000 * 1024) / 512, timeout_ms: 5_000 }
    }
}

/// Verifier tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifierConf {
    pub running: bool,
    pub one_shot: bool,
    pub scan_delay_ms: u32,
    pub bugon_on_errors: bool,
}

/// The full set of control-message-settable tunables, spec.md §6.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub max_pending_requests: u32,
    pub bgwriter: BgWriterConf,
    pub invalidator_min_invalid_count: u32,
    pub enable_extra_checksum_check: bool,
    pub read_bypass: BypassConf,
    pub write_bypass: BypassConf,
    pub trace: u16,
    pub cache_mode: CacheMode,
    pub replacement: ReplacementPolicy,
    pub devio_worker_delay_ms: u32,
    pub devio_fua_insert: u32,
    pub verifier: VerifierConf,
}

impl Tunables {
    /// Defaults as spec.md §5/§6/§4.7/§4.9 name them, clamped to
    /// `slot_count` where the bound is relative (max_pending_requests is
    /// also capped to 10% of slot count).
    pub fn defaults(slot_count: u32) -> Tunables {
        let cap_by_slots = (slot_count / 10).max(1);
        Tunables {
            max_pending_requests: 500.min(cap_by_slots.max(10)),
            bgwriter: BgWriterConf::default(),
            invalidator_min_invalid_count: 10.min(slot_count.max(1)),
            enable_extra_checksum_check: false,
            read_bypass: BypassConf::read_default(),
            write_bypass: BypassConf::write_default(),
            trace: 0,
            cache_mode: CacheMode::Writeback,
            replacement: ReplacementPolicy::default(),
            devio_worker_delay_ms: 10,
            devio_fua_insert: 4,
            verifier: VerifierConf::default(),
        }
    }

    pub fn set_max_pending_requests(&mut self, v: u32) -> Result<()> {
        if !(10..=2000).contains(&v) {
            return Err(Error::InvalidArgument(format!(
                "max_pending_requests {v} out of range 10..=2000"
            )));
        }
        self.max_pending_requests = v;
        Ok(())
    }

    pub fn set_invalidator_min_invalid_count(&mut self, v: u32) -> Result<()> {
        if !(10..=2000).contains(&v) {
            return Err(Error::InvalidArgument(format!(
                "invalidator_conf_min_invalid_count {v} out of range 10..=2000"
            )));
        }
        self.invalidator_min_invalid_count = v;
        Ok(())
    }

    pub fn set_devio_worker_delay_ms(&mut self, v: u32) -> Result<()> {
        if !(1..=100).contains(&v) {
            return Err(Error::InvalidArgument(format!(
                "devio_worker_delay {v} out of range 1..=100"
            )));
        }
        self.devio_worker_delay_ms = v;
        Ok(())
    }

    pub fn set_devio_fua_insert(&mut self, v: u32) -> Result<()> {
        if !(10..=5000).contains(&v) {
            return Err(Error::InvalidArgument(format!(
                "devio_fua_insert {v} out of range 10..=5000"
            )));
        }
        self.devio_fua_insert = v;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cap_pending_requests_to_slot_fraction() {
        let t = Tunables::defaults(1000);
        assert_eq!(t.max_pending_requests, 100);
        let t = Tunables::defaults(1_000_000);
        assert_eq!(t.max_pending_requests, 500);
    }

    #[test]
    fn setters_reject_out_of_range() {
        let mut t = Tunables::defaults(10_000);
        assert!(t.set_max_pending_requests(5).is_err());
        assert!(t.set_max_pending_requests(3000).is_err());
        assert!(t.set_max_pending_requests(200).is_ok());
        assert_eq!(t.max_pending_requests, 200);
    }

    #[test]
    fn cache_mode_roundtrips_through_str() {
        assert_eq!(CacheMode::parse("writeback").unwrap().as_str(), "writeback");
        assert!(CacheMode::parse("bogus").is_err());
    }
}
