pub mod server;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        signing_key: String,
        issuer: String,
        rate_limit_max: u32,
        rate_limit_window_seconds: u64,
        max_failed_attempts: u32,
        lockout_duration_minutes: u64,
    },
}
