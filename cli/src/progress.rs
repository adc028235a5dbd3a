// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", ":-)");

/// Returns a multi bar that draws to stderr, or nowhere when `hidden`.
pub fn new_multi_bar(hidden: bool) -> MultiProgress {
    let target = if hidden {
        ProgressDrawTarget::hidden()
    } else {
        ProgressDrawTarget::stderr()
    };
    MultiProgress::with_draw_target(target)
}

/// Spinner with a `[step/steps]` prefix and a message.
pub fn new_message_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {prefix:.bold.dim} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}
