use std::sync::Arc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath};
use object_store::PutPayload;
use bytes::Bytes;
use url::Url;

use crate::error::StoreError;

/// URI scheme served by the process-wide in-memory store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Cache key for S3 stores that distinguishes between authenticated and anonymous access
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct S3CacheKey {
    bucket: String,
    anonymous: bool,
}

/// Global cache for S3 stores, keyed by (bucket, anonymous) tuple.
///
/// Recreating an S3 store means fetching credentials again (possibly from the EC2
/// metadata service), so one store per bucket is kept for the life of the process.
/// Credentials resolved through `AmazonS3Builder::from_env()` refresh on their own
/// for IAM roles, ECS/EKS task identities and SSO sessions.
static S3_STORE_CACHE: Lazy<DashMap<S3CacheKey, Arc<dyn ObjectStore>>> =
    Lazy::new(DashMap::new);

/// Process-wide in-memory store behind `memory://` URIs.
static MEMORY_STORE: Lazy<Arc<InMemory>> = Lazy::new(|| Arc::new(InMemory::new()));

/// Gets or creates a cached S3 store for the given bucket.
///
/// # Arguments
///
/// * `bucket` - S3 bucket name (without "s3://" prefix)
/// * `anonymous` - If true, uses unsigned requests (for public buckets)
pub fn get_cached_s3_store(
    bucket: &str,
    anonymous: bool
) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let cache_key = S3CacheKey {
        bucket: bucket.to_string(),
        anonymous,
    };
    let entry = S3_STORE_CACHE.entry(cache_key);
    let store = entry.or_try_insert_with(|| {
        create_s3_store(bucket, anonymous)
    })?;
    Ok(Arc::clone(store.value()))
}

/// Resolves a URI to an `ObjectStore` and the path of the URI inside it.
///
/// # Supported Formats
///
/// * **S3**: `"s3://bucket/prefix"` or `"s3://bucket/prefix?anon=true"` (cached by bucket)
/// * **Memory**: `"memory://name"` (shared in-memory store, mostly for tests)
/// * **Local**: absolute or relative filesystem paths
///
/// The path may name a single object or a directory-like prefix; experiment
/// layouts are addressed with [`ObjectPath::child`] from the returned path.
///
/// # Errors
///
/// Returns an error if the S3 URL has no bucket, S3 store creation fails, or the
/// current directory cannot be determined for a relative local path.
///
/// # Examples
///
/// ```no_run
/// # use cellslice::utils::file_interaction_local_and_cloud::get_object_store;
/// # tokio_test::block_on(async {
/// let (store, path) = get_object_store("s3://cellxgene-census/experiment?anon=true").await.unwrap();
/// let obs = path.child("obs.parquet");
/// let meta = store.head(&obs).await.unwrap();
/// # });
/// ```
pub async fn get_object_store(
    uri: &str,
) -> Result<(Arc<dyn ObjectStore>, ObjectPath), StoreError> {
    if uri.starts_with("s3://") {
        let url = Url::parse(uri)
            .map_err(|e| StoreError::InvalidUri(format!("invalid S3 URL '{}': {}", uri, e)))?;
        let bucket = url.host_str()
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| StoreError::InvalidUri(format!("invalid S3 URL '{}': no bucket specified", uri)))?;
        let key = url.path().trim_start_matches('/');

        // Check for anonymous access flag in query parameters
        let anonymous = url.query_pairs()
            .any(|(k, v)| k == "anon" && (v == "true" || v == "1"));

        let store = get_cached_s3_store(bucket, anonymous)?;
        Ok((store, ObjectPath::from(key)))
    } else if let Some(key) = uri.strip_prefix(MEMORY_SCHEME) {
        let store: Arc<dyn ObjectStore> = MEMORY_STORE.clone();
        Ok((store, ObjectPath::from(key.trim_matches('/'))))
    } else {
        use std::path::Path as StdPath;

        let std_path = StdPath::new(uri);
        let absolute_path = if std_path.is_absolute() {
            std_path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| StoreError::NotFound(format!("cannot resolve '{}': {}", uri, e)))?
                .join(std_path)
        };

        #[cfg(windows)]
        let (root, relative) = {
            let path_str = absolute_path.to_string_lossy();
            if let Some(pos) = path_str.find(":\\") {
                let root = format!("{}:\\", &path_str[..pos]);
                let relative = path_str[pos+2..].trim_start_matches('\\').replace('\\', "/");
                (root, relative)
            } else {
                return Err(StoreError::InvalidUri(format!("invalid Windows path '{}'", uri)));
            }
        };

        #[cfg(not(windows))]
        let (root, relative) = {
            let path_str = absolute_path.to_string_lossy();
            let relative = path_str.trim_start_matches('/');
            ("/".to_string(), relative.to_string())
        };

        let local_store = LocalFileSystem::new_with_prefix(root)?;
        let store: Arc<dyn ObjectStore> = Arc::new(local_store);
        Ok((store, ObjectPath::from(relative)))
    }
}

/// Writes bytes under a `memory://` URI so they can be read back through
/// [`get_object_store`].
pub async fn register_memory_file(uri: &str, bytes: Bytes) -> Result<(), StoreError> {
    let key = uri.strip_prefix(MEMORY_SCHEME)
        .ok_or_else(|| StoreError::InvalidUri(format!("'{}' is not a memory:// URI", uri)))?;
    MEMORY_STORE
        .put(&ObjectPath::from(key.trim_matches('/')), PutPayload::from(bytes))
        .await?;
    Ok(())
}

/// Creates a reusable S3 `ObjectStore` for a specific bucket.
///
/// Credentials are resolved with `from_env()`: environment variables, the shared
/// credentials file, then instance/task/pod roles and SSO sessions.
pub fn create_s3_store(
    bucket: &str,
    anonymous: bool
) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket);

    if anonymous {
        // Skip credential loading and request signing for public buckets
        builder = builder.with_skip_signature(true);
    }

    let s3_store = builder.build()?;
    Ok(Arc::new(s3_store))
}
