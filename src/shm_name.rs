// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shm object names for frame pools.

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm names; 0 disables shortening.
///
/// macOS caps names at `PSHMNAMLEN` (31). Linux allows 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce a POSIX shm name (leading `/`).
///
/// Over-long names are shortened to `/<prefix>_<16 hex digits of FNV-1a>`,
/// keeping a readable prefix of the original.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hash = fnv1a_64(result.as_bytes());
    let body = &result[1..];
    let take = body
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= prefix_len)
        .last()
        .unwrap_or(0);

    format!("/{}_{hash:016x}", &body[..take])
}

/// Default segment name for a camera's frame pool.
pub fn frame_pool_name(camera_id: &str) -> String {
    let sanitized: String = camera_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("camd_{sanitized}_frames")
}
