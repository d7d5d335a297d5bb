// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod frame_queue;
pub mod hardware;
pub mod hw_ip;
pub mod ids;
pub mod probe;
pub mod setfile;
pub mod sim_ip;
pub mod state;
pub mod watchdog;
