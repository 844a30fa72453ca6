// Copyright 2026 Lotpilot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lotpilot runtime library — dealership listing automation.
//!
//! Scrapes vehicle listings out of third-party marketplace pages, watches
//! live conversation threads for buyer messages, and drives those same pages
//! (form fills, photo upload, chat replies) through a headless browser.

#![allow(clippy::new_without_default)]

pub mod automation;
pub mod backend;
pub mod browser;
pub mod config;
pub mod convo;
pub mod events;
pub mod extract;
pub mod monitor;
pub mod profiles;
