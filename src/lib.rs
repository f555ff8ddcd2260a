// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod http;
pub mod locks;
pub mod mailbox;
pub mod metrics;
pub mod prekeys;
pub mod protocol;
pub mod registry;
pub mod sequence;
pub mod sse;
pub mod store;
