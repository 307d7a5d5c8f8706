/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

/// Hostname of this machine, best effort.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    "localhost".to_string()
}

/// `host:pid` identity of this process, the content of lock files.
pub fn lock_identity() -> String {
    format!("{}:{}", hostname(), std::process::id())
}

/// Whether a process with the given pid is alive on this host.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        // Not a pid the kernel could have handed out.
        return false;
    }
    // kill(pid, 0) probes for existence without signalling. EPERM still
    // means the process exists.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // Without a portable probe, assume alive and let the timeout decide.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_identity_contains_pid() {
        let identity = lock_identity();
        let pid = identity.rsplit(':').next().unwrap();
        assert_eq!(pid.parse::<u32>().unwrap(), std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
