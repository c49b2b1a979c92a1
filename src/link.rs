use derive_more::{Display, Error};
use lazy_regex::regex;
use sha1::{Digest, Sha1};

/// A raw image link from a catalog row, resolved into something we can act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedLink {
    /// Already a public object-store URL, nothing to download or upload.
    Public { url: String },
    /// Needs a fetch; `content_key` identifies the underlying file for dedup.
    Remote {
        download_url: String,
        content_key: String,
    },
}

#[derive(Debug, Display, Error)]
pub enum LinkError {
    #[display("unrecognized image link: {_0}")]
    #[error(ignore)]
    Unresolvable(String),
}

pub fn is_public_storage_url(link: &str) -> bool {
    let link = link.to_lowercase();
    link.contains("/storage/v1/object/public/") && link.contains(".supabase.co")
}

/// Pulls the stable file id out of any of the known share-link shapes.
pub fn extract_file_id(link: &str) -> Option<String> {
    let by_path = regex!(r"/file/d/([A-Za-z0-9_-]+)");
    if let Some(c) = by_path.captures(link) {
        return c.get(1).map(|m| m.as_str().to_string());
    }
    let by_query = regex!(r"[?&]id=([A-Za-z0-9_-]+)");
    by_query
        .captures(link)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Dedup key for a link with no extractable file id.
pub fn hash_key(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.trim().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("hash:{hex}")
}

/// Resolves a raw link to a downloadable URL plus a content key.
///
/// The file id is preferred over the URL hash: two share-link shapes pointing
/// at the same file must collapse to the same key, which only the id gives us.
pub fn resolve(raw: &str) -> Result<ResolvedLink, LinkError> {
    let raw = raw.trim();
    if is_public_storage_url(raw) {
        return Ok(ResolvedLink::Public {
            url: raw.to_string(),
        });
    }
    if let Some(id) = extract_file_id(raw) {
        return Ok(ResolvedLink::Remote {
            download_url: format!("https://drive.google.com/uc?export=download&id={id}"),
            content_key: format!("file:{id}"),
        });
    }
    let is_http = url::Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if is_http {
        return Ok(ResolvedLink::Remote {
            download_url: raw.to_string(),
            content_key: hash_key(raw),
        });
    }
    Err(LinkError::Unresolvable(raw.to_string()))
}

#[cfg(test)]
pub mod test {

    use super::*;

    #[test]
    fn share_link_shapes_share_a_key() {
        let a = resolve("https://drive.google.com/file/d/1AbC-dEf_9/view?usp=sharing");
        let b = resolve("https://drive.google.com/open?id=1AbC-dEf_9");
        let c = resolve("https://drive.google.com/uc?export=download&id=1AbC-dEf_9");
        let key = |r: Result<ResolvedLink, LinkError>| match r {
            Ok(ResolvedLink::Remote { content_key, .. }) => content_key,
            other => panic!("expected remote link, got {other:?}"),
        };
        assert_eq!("file:1AbC-dEf_9", key(a));
        assert_eq!("file:1AbC-dEf_9", key(b));
        assert_eq!("file:1AbC-dEf_9", key(c));
    }

    #[test]
    fn rewrites_to_direct_download() {
        match resolve("https://drive.google.com/file/d/xyz/edit") {
            Ok(ResolvedLink::Remote { download_url, .. }) => assert_eq!(
                "https://drive.google.com/uc?export=download&id=xyz",
                download_url
            ),
            other => panic!("expected remote link, got {other:?}"),
        }
    }

    #[test]
    fn public_storage_urls_pass_through() {
        let url = "https://abc.supabase.co/storage/v1/object/public/catalog/shared/file:xyz.jpg";
        match resolve(url) {
            Ok(ResolvedLink::Public { url: resolved }) => assert_eq!(url, resolved),
            other => panic!("expected public link, got {other:?}"),
        }
    }

    #[test]
    fn plain_urls_fall_back_to_a_hash_key() {
        match resolve("https://example.com/img/5.png") {
            Ok(ResolvedLink::Remote {
                download_url,
                content_key,
            }) => {
                assert_eq!("https://example.com/img/5.png", download_url);
                assert!(content_key.starts_with("hash:"));
                assert_eq!(content_key, hash_key("https://example.com/img/5.png"));
            }
            other => panic!("expected remote link, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_unresolvable() {
        assert!(resolve("not a link at all").is_err());
        assert!(resolve("ftp://example.com/file.jpg").is_err());
    }
}
