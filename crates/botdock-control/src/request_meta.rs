/// Per-request data injected by `security::request_id`.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
}
