use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::push::{FcmSender, PushSender};
use crate::role_cache::RoleCache;
use crate::uploads::{CloudinaryHost, ImageHost};

pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub roles: RoleCache,
    pub images: Option<Arc<dyn ImageHost>>,
    pub push: Option<Arc<dyn PushSender>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Arc<Self> {
        let http = reqwest::Client::new();

        let images = config
            .cloudinary
            .clone()
            .map(|c| Arc::new(CloudinaryHost::new(http.clone(), c)) as Arc<dyn ImageHost>);
        let push = config
            .fcm
            .clone()
            .map(|c| Arc::new(FcmSender::new(http, c)) as Arc<dyn PushSender>);

        Arc::new(Self {
            pool,
            roles: RoleCache::new(config.role_cache_ttl),
            config,
            images,
            push,
        })
    }
}
