// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Streaming separation of model output into reasoning and response.
//!
//! Models mark internal reasoning with delimiters: XML-like tags, fenced
//! blocks, bracketed markers, or a leading phrase.  The filter consumes the
//! token stream and routes delimited regions to a thought channel while the
//! remainder accumulates as the cleaned response.  Because a delimiter can be
//! split across stream chunks, the machine buffers an ambiguous tail until it
//! either completes a delimiter or turns out to be ordinary text.
//!
//! The delimiter set is a value, not a constant: callers construct the filter
//! with their own [`ThoughtDelimiters`] (tests substitute tiny sets).

use std::sync::Arc;

/// One open/close delimiter pair.
#[derive(Debug, Clone)]
pub struct DelimiterPair {
    pub open: String,
    pub close: String,
}

impl DelimiterPair {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

/// The recognized reasoning markers.
#[derive(Debug, Clone)]
pub struct ThoughtDelimiters {
    pub pairs: Vec<DelimiterPair>,
    /// Phrases that open a reasoning region when they lead the response.
    /// Only honoured for agents with thinking enabled; the region closes at
    /// the first blank line.
    pub leading_phrases: Vec<String>,
}

impl Default for ThoughtDelimiters {
    fn default() -> Self {
        Self {
            pairs: vec![
                DelimiterPair::new("<thinking>", "</thinking>"),
                DelimiterPair::new("<think>", "</think>"),
                DelimiterPair::new("<reasoning>", "</reasoning>"),
                DelimiterPair::new("```thinking", "```"),
                DelimiterPair::new("[thinking]", "[/thinking]"),
            ],
            leading_phrases: vec!["Thinking:".into(), "Chain of thought:".into()],
        }
    }
}

/// Blank line that closes a leading-phrase reasoning region.
const PHRASE_CLOSE: &str = "\n\n";

/// Output of one filter step: text routed to each side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutput {
    pub clean: String,
    pub thought: String,
}

impl FilterOutput {
    pub fn is_empty(&self) -> bool {
        self.clean.is_empty() && self.thought.is_empty()
    }
}

/// Machine states.  A non-empty `held` buffer is an ambiguous boundary: a
/// tail that is the prefix of an open delimiter (outside) or of the active
/// close delimiter (inside), awaiting more input to disambiguate.
#[derive(Debug)]
enum FilterState {
    Outside { held: String },
    Inside { close: String, held: String },
}

pub struct ThoughtFilter {
    delims: Arc<ThoughtDelimiters>,
    thinking_enabled: bool,
    state: FilterState,
    at_stream_start: bool,
}

impl ThoughtFilter {
    pub fn new(delims: Arc<ThoughtDelimiters>, thinking_enabled: bool) -> Self {
        Self {
            delims,
            thinking_enabled,
            state: FilterState::Outside { held: String::new() },
            at_stream_start: true,
        }
    }

    /// Feed one stream chunk through the machine.
    pub fn push(&mut self, chunk: &str) -> FilterOutput {
        let mut out = FilterOutput::default();
        let mut text = match &mut self.state {
            FilterState::Outside { held } | FilterState::Inside { held, .. } => {
                let mut t = std::mem::take(held);
                t.push_str(chunk);
                t
            }
        };

        loop {
            match &self.state {
                FilterState::Outside { .. } => {
                    if self.at_stream_start && self.thinking_enabled {
                        match match_leading_phrase(&text, &self.delims.leading_phrases) {
                            PhraseMatch::Full(len) => {
                                self.at_stream_start = false;
                                text.drain(..len);
                                self.state = FilterState::Inside {
                                    close: PHRASE_CLOSE.into(),
                                    held: String::new(),
                                };
                                continue;
                            }
                            PhraseMatch::Partial => {
                                // Could still become a phrase; hold everything.
                                self.state = FilterState::Outside { held: text };
                                return out;
                            }
                            PhraseMatch::None => {}
                        }
                    }

                    match scan_open(&text, &self.delims.pairs) {
                        OpenScan::Match { start, end, close } => {
                            out.clean.push_str(&text[..start]);
                            if start > 0 {
                                self.at_stream_start = false;
                            }
                            text.drain(..end);
                            self.state = FilterState::Inside {
                                close,
                                held: String::new(),
                            };
                            continue;
                        }
                        OpenScan::Partial { at } => {
                            out.clean.push_str(&text[..at]);
                            if at > 0 {
                                self.at_stream_start = false;
                            }
                            let held = text.split_off(at);
                            self.state = FilterState::Outside { held };
                            break;
                        }
                        OpenScan::None => {
                            if !text.is_empty() {
                                self.at_stream_start = false;
                            }
                            out.clean.push_str(&text);
                            self.state = FilterState::Outside {
                                held: String::new(),
                            };
                            break;
                        }
                    }
                }
                FilterState::Inside { close, .. } => {
                    self.at_stream_start = false;
                    if let Some(pos) = text.find(close.as_str()) {
                        out.thought.push_str(&text[..pos]);
                        text.drain(..pos + close.len());
                        self.state = FilterState::Outside {
                            held: String::new(),
                        };
                        continue;
                    }
                    let keep = longest_suffix_prefix(&text, close);
                    let cut = text.len() - keep;
                    out.thought.push_str(&text[..cut]);
                    let held = text.split_off(cut);
                    let close = close.clone();
                    self.state = FilterState::Inside { close, held };
                    break;
                }
            }
        }
        out
    }

    /// Flush at end of stream.  An unterminated reasoning region stays a
    /// thought and never leaks into the response; a held prefix that never
    /// became a delimiter is ordinary text.
    pub fn finish(&mut self) -> FilterOutput {
        let mut out = FilterOutput::default();
        match std::mem::replace(
            &mut self.state,
            FilterState::Outside {
                held: String::new(),
            },
        ) {
            FilterState::Outside { held } => out.clean = held,
            FilterState::Inside { held, .. } => out.thought = held,
        }
        out
    }
}

enum PhraseMatch {
    Full(usize),
    Partial,
    None,
}

fn match_leading_phrase(text: &str, phrases: &[String]) -> PhraseMatch {
    let mut best_full = 0usize;
    let mut any_partial = false;
    for phrase in phrases {
        if phrase.is_empty() {
            continue;
        }
        if text.starts_with(phrase.as_str()) {
            best_full = best_full.max(phrase.len());
        } else if phrase.starts_with(text) && !text.is_empty() {
            any_partial = true;
        }
    }
    if best_full > 0 {
        PhraseMatch::Full(best_full)
    } else if any_partial {
        PhraseMatch::Partial
    } else {
        PhraseMatch::None
    }
}

enum OpenScan {
    /// A full open delimiter occurs at `start..end`; its close pattern.
    Match {
        start: usize,
        end: usize,
        close: String,
    },
    /// `text[at..]` is a prefix of at least one open delimiter.
    Partial { at: usize },
    None,
}

/// Find the earliest full open delimiter (longest wins on position ties), or
/// the longest tail that could still become one.
fn scan_open(text: &str, pairs: &[DelimiterPair]) -> OpenScan {
    let mut best: Option<(usize, usize, &DelimiterPair)> = None;
    for pair in pairs {
        if pair.open.is_empty() || pair.close.is_empty() {
            continue;
        }
        if let Some(pos) = text.find(pair.open.as_str()) {
            let better = match best {
                None => true,
                Some((bpos, blen, _)) => pos < bpos || (pos == bpos && pair.open.len() > blen),
            };
            if better {
                best = Some((pos, pair.open.len(), pair));
            }
        }
    }
    if let Some((pos, len, pair)) = best {
        return OpenScan::Match {
            start: pos,
            end: pos + len,
            close: pair.close.clone(),
        };
    }

    let mut keep = 0usize;
    for pair in pairs {
        keep = keep.max(longest_suffix_prefix(text, &pair.open));
    }
    if keep > 0 {
        OpenScan::Partial {
            at: text.len() - keep,
        }
    } else {
        OpenScan::None
    }
}

/// Length of the longest *proper* prefix of `pat` that is a suffix of `text`.
fn longest_suffix_prefix(text: &str, pat: &str) -> usize {
    let mut boundaries: Vec<usize> = pat.char_indices().map(|(i, _)| i).skip(1).collect();
    boundaries.reverse();
    for k in boundaries {
        if k <= text.len() && text.ends_with(&pat[..k]) {
            return k;
        }
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
