// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

// The daemon drives POSIX-only camera SDKs; there is no Windows backend.

pub mod posix;

pub use posix::PlatformShm;
