//! Engine counters, reported through [`crate::RiscV::stats`] and the
//! per-block profile hook. The core only produces these numbers; what to
//! do with them is the embedder's business.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Translation-cache lookups that missed and forced block formation.
    pub cache_misses: u64,
    /// Lookups served by the previous block's prediction link.
    pub predict_hits: u64,
    pub blocks_translated: u64,
    /// Blocks compiled into a code page (recompilations included).
    pub pages_compiled: u64,
    /// Code-page acquisitions that revoked another block's ownership.
    pub page_recycles: u64,
    /// Full translation flushes (policy A overflow).
    pub flushes: u64,
    /// Native regions compiled (dynarec feature).
    pub native_regions: u64,
    pub native_compile_failures: u64,
    pub native_executions: u64,
}
