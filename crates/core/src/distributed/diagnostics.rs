//! Caller-owned advisory channel for pipeline mode.
//!
//! Requested features that pipeline mode cannot honour are switched off and
//! reported here instead of failing the call. Each advisory is recorded once
//! per [`Diagnostics`] value and also emitted as a `tracing` warning.

use std::collections::HashSet;
use std::fmt;

/// Feature downgraded in pipeline mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Advisory {
    PastKeyValuesIgnored,
    OutputAttentionsDisabled,
    OutputHiddenStatesDisabled,
    UseCacheDisabled,
    /// `head_mask` was reused for the decoder because `decoder_head_mask` was
    /// not given and both stacks have the same depth.
    DecoderHeadMaskCopied,
}

impl Advisory {
    pub fn message(&self) -> &'static str {
        match self {
            Self::PastKeyValuesIgnored => {
                "non-empty past_key_values is not supported for pipeline models at the moment"
            }
            Self::OutputAttentionsDisabled => {
                "output_attentions=true is not supported for pipeline models at the moment"
            }
            Self::OutputHiddenStatesDisabled => {
                "output_hidden_states=true is not supported for pipeline models at the moment"
            }
            Self::UseCacheDisabled => {
                "use_cache=true is not supported for pipeline models at the moment"
            }
            Self::DecoderHeadMaskCopied => {
                "head_mask was split into head_mask and decoder_head_mask; \
                 decoder_head_mask is set to a copy of head_mask"
            }
        }
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Structured warnings collected across staged forward calls.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    seen: HashSet<Advisory>,
    warnings: Vec<Advisory>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `advisory`. Returns `true` the first time it is seen.
    pub fn warn_once(&mut self, advisory: Advisory) -> bool {
        if !self.seen.insert(advisory) {
            return false;
        }
        tracing::warn!(advisory = ?advisory, "{}", advisory.message());
        self.warnings.push(advisory);
        true
    }

    /// Advisories in the order they were first raised.
    pub fn warnings(&self) -> &[Advisory] {
        &self.warnings
    }

    pub fn contains(&self, advisory: Advisory) -> bool {
        self.seen.contains(&advisory)
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}
