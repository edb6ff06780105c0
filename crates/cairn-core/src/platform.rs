/// Return the system hostname, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    #[cfg(windows)]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

/// Current username, falling back to `$USER` and then `"unknown"`.
pub fn username() -> String {
    #[cfg(unix)]
    {
        use nix::unistd::{Uid, User};
        if let Ok(Some(user)) = User::from_uid(Uid::current()) {
            return user.name;
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".into())
}

/// Numeric user id (0 on platforms without one).
pub fn uid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::Uid::current().as_raw()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Numeric group id (0 on platforms without one).
pub fn gid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::Gid::current().as_raw()
    }
    #[cfg(not(unix))]
    {
        0
    }
}
