pub mod typing;

use std::sync::Arc;

pub struct Service {
    pub typing: Arc<typing::Service>,
}
