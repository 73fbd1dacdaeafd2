// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod matcher;
pub mod mention;

pub use matcher::match_score;
pub use mention::{detect_trigger, Candidate, CandidateKind, MentionResolver, Splice, Trigger};
