extern crate libc;
use std::io::Write;

pub fn now_nanos() -> i64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64;
}

pub fn localtime_r(seconds: i64, tm: &mut libc::tm) {
    let t = seconds as libc::time_t;
    unsafe {
        #[cfg(target_os = "linux")]
        {
            libc::localtime_r(&t, tm);
        }
        #[cfg(not(target_os = "linux"))]
        {
            libc::localtime_s(tm, &t);
        }
    }
}
pub fn gmtime_r(seconds: i64, tm: &mut libc::tm) {
    let t = seconds as libc::time_t;
    unsafe {
        #[cfg(target_os = "linux")]
        {
            libc::gmtime_r(&t, tm);
        }
        #[cfg(not(target_os = "linux"))]
        {
            libc::gmtime_s(tm, &t);
        }
    }
}

/// Format nownanos into "YYYYmmdd-HH:MM:SS[.subsec]" in the supplied buffer.
/// subsecond_digits may only be 0, 3, 6 or 9.
pub fn format_time(buffer: &mut [u8], nownanos: i64, subsecond_digits: u32, gmt_time: bool) -> &str {
    debug_assert!(buffer.len() as u32 > 17 + subsecond_digits + 1);
    let (seconds, nanos) = (nownanos / 1000000000, nownanos % 1000000000);
    let mut tm: libc::tm = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };

    if gmt_time {
        gmtime_r(seconds, &mut tm);
    } else {
        localtime_r(seconds, &mut tm);
    }
    write!(
        &mut buffer[..],
        "{:04}{:02}{:02}-{:02}:{:02}:{:02}",
        (tm.tm_year + 1900),
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
    .unwrap();
    let mut n = 17usize;
    if subsecond_digits > 0 && subsecond_digits < 10 {
        if subsecond_digits == 3 {
            write!(&mut buffer[n..], ".{:03}", nanos / 1000000).unwrap();
        } else if subsecond_digits == 6 {
            write!(&mut buffer[n..], ".{:06}", nanos / 1000).unwrap();
        } else {
            write!(&mut buffer[n..], ".{:09}", nanos).unwrap();
        }
        n += ((subsecond_digits / 3) * 3 + 1) as usize;
    }
    std::str::from_utf8(&buffer[..n]).unwrap()
}

/// Deadline helper for polling loops in tests and shutdown paths.
pub struct Timer {
    deadline: std::time::Instant,
}
impl Timer {
    pub fn new_millis(millis: u64) -> Self {
        Self {
            deadline: std::time::Instant::now() + std::time::Duration::from_millis(millis),
        }
    }
    pub fn expired(&self) -> bool {
        return std::time::Instant::now() >= self.deadline;
    }
}

#[macro_export]
macro_rules! logmsg {
    ($( $args:expr ),*) => {
        let mut buf = [0u8; 40];
        print!("[{}] ", $crate::utils::format_time(&mut buf, $crate::utils::now_nanos(), 6, false));
        println!( $( $args ),* );
    }
}

#[macro_export]
/// log only in debug mode.
#[cfg(debug_assertions)]
macro_rules! dbglog {
    ($( $args:expr ),*) => {
        let mut buf = [0u8; 40];
        print!("[{}] [DBG] ", $crate::utils::format_time(&mut buf, $crate::utils::now_nanos(), 6, false));
        println!( $( $args ),* );
    }
}
#[allow(unused_macros)]
#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! dbglog {
    ($( $args:expr ),*) => {
        ()
    };
}
