use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use reqwest::StatusCode;
use url::Url;
use crate::Config;

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("failed to fetch {url}: {source}")]
    SourceFetchFailed {
        url: Url,
        source: reqwest::Error,
    },

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),

}

// Where a torrent comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {

    // A local path, an http(s) url or a magnet link.
    Text(String),

    // Contents of a .torrent file.
    Bytes(Vec<u8>),

}

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        Source::Text(s.to_string())
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        Source::Text(s)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::Text(path.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::from(path.as_path())
    }
}

impl From<Url> for Source {
    fn from(url: Url) -> Self {
        Source::Text(url.into())
    }
}

impl From<Vec<u8>> for Source {
    fn from(data: Vec<u8>) -> Self {
        Source::Bytes(data)
    }
}

// A source reduced to something a session can be built from.
#[derive(Clone, PartialEq, Eq)]
pub enum Resolved {

    Torrent(Vec<u8>),

    Magnet(String),

}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Resolved::Torrent(data) => write!(f, "Torrent({} bytes)", data.len()),
            Resolved::Magnet(link) => f.debug_tuple("Magnet").field(link).finish(),
        }
    }
}

// Delay before the nth retry of a fetch.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SourceResolver {

    client: reqwest::Client,

    // Extra attempts after a failed fetch.
    retry_limit: u32,

}

impl SourceResolver {

    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.session.user_agent.as_str())
            .build()
            .map_err(SourceError::HttpClient)?;
        Ok(Self {
            client,
            retry_limit: config.retry_limit,
        })
    }

    // Turns a source into torrent data or a magnet link. Local paths win over
    // urls, so a file named like a url is still read from disk.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(&self, source: Source) -> Result<Resolved> {
        let text = match source {
            Source::Bytes(data) => return Ok(Resolved::Torrent(data)),
            Source::Text(text) => text,
        };

        // Single letter schemes are windows drive letters.
        let url = Url::parse(&text).ok().filter(|url| url.scheme().len() > 1);
        let path = Path::new(&text);
        match tokio::fs::read(path).await {
            Ok(data) => {
                tracing::debug!("read {} bytes from {}", data.len(), path.display());
                return Ok(Resolved::Torrent(data));
            },
            // Urls can fail as paths in other ways, long magnet links do.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound || url.is_some() => {},
            Err(e) => return Err(e.into()),
        }

        match url {
            Some(url) => match url.scheme() {
                "http" | "https" => Ok(Resolved::Torrent(self.fetch(url).await?)),
                "magnet" => Ok(Resolved::Magnet(text)),
                _ => Err(SourceError::UnsupportedSource(text)),
            },
            None if looks_like_path(path) => Err(SourceError::SourceNotFound(path.to_path_buf())),
            None => Err(SourceError::UnsupportedSource(text)),
        }
    }

    async fn fetch(&self, url: Url) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.try_fetch(&url).await {
                Ok(data) => {
                    tracing::debug!("fetched {} bytes from {}", data.len(), url);
                    return Ok(data);
                },
                Err(e) if attempt < self.retry_limit && is_retryable(&e) => {
                    attempt += 1;
                    tracing::warn!("fetching {} failed, retry {}/{}: {}", url, attempt, self.retry_limit, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                },
                Err(source) => return Err(SourceError::SourceFetchFailed { url, source }),
            }
        }
    }

    async fn try_fetch(&self, url: &Url) -> reqwest::Result<Vec<u8>> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

}

fn is_retryable(e: &reqwest::Error) -> bool {
    match e.status() {
        Some(status) => {
            status.is_server_error()
                || status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS
        },
        None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
    }
}

fn looks_like_path(path: &Path) -> bool {
    path.is_absolute()
        || path.components().count() > 1
        || path.extension().map_or(false, |ext| ext == "torrent")
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use http_body_util::Full;
    use hyper::{body::Bytes, server::conn::http1, service::service_fn, Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;
    use super::*;
    use crate::test_util;

    async fn route(path: &str, hit: usize) -> Response<Full<Bytes>> {
        let (status, body) = match path {
            "/alpha.torrent" => (StatusCode::OK, test_util::torrent("alpha.bin", 1024)),
            "/flaky.torrent" if hit == 0 => (StatusCode::SERVICE_UNAVAILABLE, Vec::new()),
            "/flaky.torrent" => (StatusCode::OK, test_util::torrent("flaky.bin", 1024)),
            "/slow.torrent" => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                (StatusCode::OK, Vec::new())
            },
            _ => (StatusCode::NOT_FOUND, Vec::new()),
        };
        Response::builder()
            .status(status.as_u16())
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    // Serves `route` on a local port, counting requests in `hits`.
    async fn serve(hits: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let hits = hits.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let hit = hits.fetch_add(1, Ordering::SeqCst);
                        async move { Ok::<_, Infallible>(route(req.uri().path(), hit).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        address
    }

    fn resolver(retry_limit: u32, request_timeout: Duration) -> SourceResolver {
        let config = Config {
            retry_limit,
            request_timeout,
            ..Default::default()
        };
        SourceResolver::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_local_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("alpha.torrent");
        let data = test_util::torrent("alpha.bin", 1024);
        std::fs::write(&path, &data)?;

        let resolved = resolver(0, Duration::from_secs(5)).resolve(path.into()).await?;
        assert_eq!(resolved, Resolved::Torrent(data));
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_is_io_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = resolver(0, Duration::from_secs(5))
            .resolve(dir.path().into())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io(_)), "{:?}", err);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_path() {
        let resolver = resolver(0, Duration::from_secs(5));
        for missing in ["/no/such/file.torrent", "no/such/file", "nothing.torrent"] {
            let err = resolver.resolve(missing.into()).await.unwrap_err();
            assert!(matches!(err, SourceError::SourceNotFound(_)), "{}: {:?}", missing, err);
        }
    }

    #[tokio::test]
    async fn test_unsupported() {
        let resolver = resolver(0, Duration::from_secs(5));
        for source in ["ftp://host.example/a.torrent", "just some words"] {
            let err = resolver.resolve(source.into()).await.unwrap_err();
            assert!(matches!(err, SourceError::UnsupportedSource(_)), "{}: {:?}", source, err);
        }
    }

    #[tokio::test]
    async fn test_inline_sources_pass_through() -> anyhow::Result<()> {
        let resolver = resolver(0, Duration::from_secs(5));
        let magnet = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        assert_eq!(resolver.resolve(magnet.into()).await?, Resolved::Magnet(magnet.to_string()));

        let data = test_util::torrent("alpha.bin", 1024);
        assert_eq!(resolver.resolve(data.clone().into()).await?, Resolved::Torrent(data));
        Ok(())
    }

    #[tokio::test]
    async fn test_long_magnet_not_read_as_path() -> anyhow::Result<()> {
        let magnet = format!(
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn={}",
            "a".repeat(300),
        );
        let resolved = resolver(0, Duration::from_secs(5)).resolve(magnet.clone().into()).await?;
        assert_eq!(resolved, Resolved::Magnet(magnet));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch() -> anyhow::Result<()> {
        test_util::init_tracing();
        let hits = Arc::new(AtomicUsize::new(0));
        let address = serve(hits.clone()).await;

        let url = format!("http://{}/alpha.torrent", address);
        let resolved = resolver(0, Duration::from_secs(5)).resolve(url.into()).await?;
        assert_eq!(resolved, Resolved::Torrent(test_util::torrent("alpha.bin", 1024)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() -> anyhow::Result<()> {
        test_util::init_tracing();

        // Without retries the first 503 is final.
        let hits = Arc::new(AtomicUsize::new(0));
        let url = format!("http://{}/flaky.torrent", serve(hits.clone()).await);
        let err = resolver(0, Duration::from_secs(5)).resolve(url.into()).await.unwrap_err();
        assert!(matches!(err, SourceError::SourceFetchFailed { .. }), "{:?}", err);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let hits = Arc::new(AtomicUsize::new(0));
        let url = format!("http://{}/flaky.torrent", serve(hits.clone()).await);
        let resolved = resolver(1, Duration::from_secs(5)).resolve(url.into()).await?;
        assert_eq!(resolved, Resolved::Torrent(test_util::torrent("flaky.bin", 1024)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_client_errors_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = format!("http://{}/missing.torrent", serve(hits.clone()).await);
        let err = resolver(3, Duration::from_secs(5)).resolve(url.into()).await.unwrap_err();
        match err {
            SourceError::SourceFetchFailed { source, .. } => {
                assert_eq!(source.status(), Some(StatusCode::NOT_FOUND))
            },
            e => panic!("unexpected error {:?}", e),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = format!("http://{}/slow.torrent", serve(hits.clone()).await);
        let err = resolver(0, Duration::from_millis(200)).resolve(url.into()).await.unwrap_err();
        match err {
            SourceError::SourceFetchFailed { source, .. } => assert!(source.is_timeout()),
            e => panic!("unexpected error {:?}", e),
        }
    }
}
