/// Filter integration test. The body runs in a dedicated process and
/// evaluates to `anyhow::Result<()>`. Tests are skipped if the kernel does not
/// support seccomp filters.
#[macro_export]
macro_rules! test {
    ($name:ident, $e:expr) => {
        rusty_fork::rusty_fork_test! {
            #![rusty_fork(timeout_ms = 30000)]
            #[test]
            fn $name() {
                $crate::logger::init();
                log::set_max_level(log::LevelFilter::Debug);

                if !$crate::supported() {
                    return;
                }

                let body = || -> anyhow::Result<()> { $e };
                if let Err(e) = body() {
                    panic!("{:?}", e);
                }
            }
        }
    };
}
