macro_rules! fatal {
    ( $fmt:expr $( , $arg:expr )* ) => {{
        log::error!($fmt $( , $arg )*);
        ::std::process::exit($crate::FAIL_STATUS)
    }};
}

pub(crate) fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
