use crate::config::Settings;
use crate::db::{self, DbPool};
use crate::queue::{JobQueue, RedisQueue};
use crate::storage::S3MediaStorage;
use crate::vision::VisionClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DB_CONNECT_ATTEMPTS: u32 = 5;

pub struct Infrastructure {
    pub db_pool: DbPool,
    pub queue: Arc<RedisQueue>,
    pub storage: S3MediaStorage,
    pub vision: VisionClient,
}

pub async fn setup(settings: &Settings) -> Result<Infrastructure, Box<dyn std::error::Error + Send + Sync>> {
    // 1. Initialize DB (with Retry)
    let mut db_retry_attempts = 0;
    let db_pool = loop {
        match db::init_pool(&settings.database_url).await {
            Ok(pool) => break pool,
            Err(e) => {
                db_retry_attempts += 1;
                if db_retry_attempts > DB_CONNECT_ATTEMPTS {
                    error!("❌ Failed to connect to DB after {} attempts. Exiting.", DB_CONNECT_ATTEMPTS);
                    return Err(e);
                }
                warn!("⚠️  DB Connection failed: {}. Retrying in 5s... ({}/{})", e, db_retry_attempts, DB_CONNECT_ATTEMPTS);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    info!("✅ Database connected successfully.");

    // 2. Initialize Redis Queue
    if settings.redis_url.starts_with("rediss://") {
        info!("🔐 Initializing Redis with TLS encryption...");
    } else {
        info!("🔌 Initializing Redis via standard connection...");
    }
    let queue = Arc::new(RedisQueue::new(&settings.redis_url)?);
    queue.ping().await?;
    info!("Connected to Redis Queue successfully.");

    // Dispatch tasks left in flight by a previous instance
    info!("🔎 Checking for stranded dispatch tasks...");
    match queue.restore_stranded().await {
        Ok(0) => info!("✅ No stranded dispatch tasks found."),
        Ok(count) => info!("♻️  Restored {} stranded dispatch tasks to the main queue.", count),
        Err(e) => error!("❌ Failed to restore stranded dispatch tasks: {}", e),
    }

    // 3. Media storage
    let storage = S3MediaStorage::from_env(
        settings.s3_bucket.clone(),
        settings.s3_endpoint.as_deref(),
        settings.s3_force_path_style,
    )
    .await;

    // 4. Vision service client
    let vision = VisionClient::new(
        &settings.vision_service_url,
        settings.vision_timeout,
        settings.vision_max_retries,
    )?;
    info!("Vision service at {}", settings.vision_service_url);

    Ok(Infrastructure { db_pool, queue, storage, vision })
}
