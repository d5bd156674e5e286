//! Checktype catalog loader (spec §4.5). Fetches JSON documents from file
//! or HTTP(S) URLs and merges them into one name -> [`Checktype`] mapping,
//! later URLs overriding earlier ones.

use tracing::info;

use crate::error::CatalogError;
use crate::types::{ChecktypeCatalog, ChecktypeDocument};

/// Build a catalog from a list of file or HTTP(S) URLs.
pub async fn new_checktype_catalog(urls: &[String]) -> Result<ChecktypeCatalog, CatalogError> {
    let mut catalog = ChecktypeCatalog::default();
    for url in urls {
        info!(%url, "fetching checktype catalog");
        let doc = fetch_document(url).await?;
        catalog.merge(doc);
    }
    Ok(catalog)
}

async fn fetch_document(url: &str) -> Result<ChecktypeDocument, CatalogError> {
    let body = if let Some(path) = url.strip_prefix("file://") {
        read_file(path).await?
    } else if url.starts_with("http://") || url.starts_with("https://") {
        fetch_http(url).await?
    } else if !url.contains("://") {
        // Bare path, no scheme: treat as a file.
        read_file(url).await?
    } else {
        return Err(CatalogError::InvalidScheme(url.to_string()));
    };

    serde_json::from_str(&body).map_err(CatalogError::from)
}

async fn read_file(path: &str) -> Result<String, CatalogError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CatalogError::Io {
            path: path.to_string(),
            source,
        })
}

async fn fetch_http(url: &str) -> Result<String, CatalogError> {
    let response = reqwest::get(url)
        .await
        .map_err(|source| CatalogError::Http {
            url: url.to_string(),
            source,
        })?;
    if !response.status().is_success() {
        return Err(CatalogError::BadStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    response
        .text()
        .await
        .map_err(|source| CatalogError::Http {
            url: url.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn merges_catalogs_later_url_wins() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        write!(
            first,
            r#"{{"checktypes":[{{"name":"a","image":"img:1","assets":["Hostname"]}}]}}"#
        )
        .unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        write!(
            second,
            r#"{{"checktypes":[{{"name":"a","image":"img:2","assets":["DomainName"]}}]}}"#
        )
        .unwrap();

        let urls = vec![
            first.path().to_str().unwrap().to_string(),
            second.path().to_str().unwrap().to_string(),
        ];
        let catalog = new_checktype_catalog(&urls).await.unwrap();
        assert_eq!(catalog.checktypes.len(), 1);
        assert_eq!(catalog.checktypes["a"].image, "img:2");
    }

    #[tokio::test]
    async fn invalid_scheme_errors() {
        let err = fetch_document("ftp://example.com/catalog.json").await;
        assert!(matches!(err, Err(CatalogError::InvalidScheme(_))));
    }

    #[tokio::test]
    async fn fetches_catalog_over_http() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/checktypes.json");
            then.status(200)
                .body(r#"{"checktypes":[{"name":"a","image":"img:1","assets":["Hostname"]}]}"#);
        });

        let url = server.url("/checktypes.json");
        let catalog = new_checktype_catalog(&[url]).await.unwrap();
        mock.assert();
        assert_eq!(catalog.checktypes["a"].image, "img:1");
    }

    #[tokio::test]
    async fn non_2xx_status_errors() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/missing.json");
            then.status(404);
        });

        let url = server.url("/missing.json");
        let err = fetch_document(&url).await;
        assert!(matches!(err, Err(CatalogError::BadStatus { .. })));
    }
}
