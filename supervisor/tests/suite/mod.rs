mod concurrency;
#[cfg(unix)]
mod portable_pty;
