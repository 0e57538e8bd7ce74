pub mod middleware;
pub mod routes;

// Re-export public types and functions
pub use middleware::log_request_errors;
pub use routes::{health, home, media, not_found, secure_filename, upload_media, upload_page, webapp};
