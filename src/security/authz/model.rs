//! Model text sources.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use casbin::DefaultModel;

use super::adapter::{http_get, Fetched};
use super::PolicyError;
use crate::http::Tripper;

#[derive(Clone)]
pub enum ModelSource {
    File(PathBuf),
    /// Model text fetched over HTTP. The tripper carries any
    /// header-injecting tripperware.
    Http { url: Uri, tripper: Tripper, timeout: Duration },
    /// Model text given inline.
    Text(String),
}

impl ModelSource {
    pub async fn text(&self) -> Result<String, PolicyError> {
        match self {
            ModelSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| PolicyError::Io(format!("{}: {e}", path.display()))),
            ModelSource::Http { url, tripper, timeout } => {
                match http_get(tripper, url, *timeout, &HeaderMap::new()).await? {
                    Fetched::Body { body, .. } => {
                        String::from_utf8(body.to_vec()).map_err(|e| PolicyError::Model(e.to_string()))
                    }
                    Fetched::NotModified => Err(PolicyError::Status(304)),
                }
            }
            ModelSource::Text(text) => Ok(text.clone()),
        }
    }

    pub async fn load(&self) -> Result<DefaultModel, PolicyError> {
        let text = self.text().await?;
        DefaultModel::from_str(&text)
            .await
            .map_err(|e| PolicyError::Model(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{chain_trippers, tripper_fn, BoxError, Tripperware};
    use crate::http::proxy::HeaderInjector;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use std::sync::Arc;

    const RBAC: &str = "[request_definition]\nr = sub, obj, act\n\n\
        [policy_definition]\np = sub, obj, act\n\n\
        [role_definition]\ng = _, _\n\n\
        [policy_effect]\ne = some(where (p.eft == allow))\n\n\
        [matchers]\nm = g(r.sub, p.sub) && keyMatch(r.obj, p.obj) && r.act == p.act\n";

    #[tokio::test]
    async fn loads_from_http_with_injected_headers() {
        let upstream = tripper_fn(|req: Request<Body>| async move {
            if req.headers().get("authorization").map(|v| v.as_bytes()) != Some(b"Bearer t") {
                return Ok::<_, BoxError>(Response::builder().status(401).body(Body::empty()).unwrap());
            }
            Ok(Response::new(Body::from(RBAC)))
        });
        let injector: Arc<dyn Tripperware> = Arc::new(HeaderInjector::new([("Authorization", "Bearer t")]).unwrap());

        let plain = ModelSource::Http {
            url: Uri::from_static("http://model.test/rbac.conf"),
            tripper: upstream.clone(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(plain.load().await, Err(PolicyError::Status(401))));

        let injected = ModelSource::Http {
            url: Uri::from_static("http://model.test/rbac.conf"),
            tripper: chain_trippers(&[injector], upstream),
            timeout: Duration::from_secs(1),
        };
        assert!(injected.load().await.is_ok());
    }

    #[tokio::test]
    async fn missing_file_and_bad_text() {
        assert!(matches!(
            ModelSource::File("/nonexistent/model.conf".into()).load().await,
            Err(PolicyError::Io(_))
        ));
        assert!(matches!(
            ModelSource::Text("[matchers]\nno assignment here\n".into()).load().await,
            Err(PolicyError::Model(_))
        ));
    }
}
