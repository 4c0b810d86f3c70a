/// Returns a unique port for each test to avoid race conditions.
pub fn get_unique_port() -> u16 {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static PORT: AtomicUsize = AtomicUsize::new(9000);
    PORT.fetch_add(1, Ordering::SeqCst) as u16
}
