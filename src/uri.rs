//! Address parsing for the five backend dialects.
//!
//! Each backend addresses objects with its own URI shape:
//!
//! - `oci://namespace@region/bucket/key…` or `oci://n/namespace/b/bucket/o/key…`
//! - `s3://bucket[@region]/key…`
//! - `gs://bucket/key…`
//! - `azure://container@account/key…`
//! - `github://owner/repo[@ref]/path…` (ref defaults to `"main"`)
//!
//! Parsing is hand-rolled with `split_once`/`strip_prefix` rather than
//! pulled from the `url` crate, since none of these dialects carry
//! query strings, fragments, or userinfo -- a general URL parser would
//! buy nothing here.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::provider::Provider;

/// A parsed address: which provider and bucket it names, the
/// object/prefix split within that bucket (mutually exclusive -- an
/// object names one identity, a prefix names a set), and whatever
/// provider-specific fields (namespace, region, account, owner/repo/ref)
/// the dialect carries. `(provider, bucket, object)` uniquely
/// identifies one object instance within a backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub provider: Provider,
    pub bucket: String,
    pub object: Option<String>,
    pub prefix: Option<String>,
    pub namespace: Option<String>,
    pub region: Option<String>,
    pub extra: HashMap<String, String>,
}

impl Address {
    fn new(provider: Provider, bucket: impl Into<String>) -> Self {
        Self {
            provider,
            bucket: bucket.into(),
            object: None,
            prefix: None,
            namespace: None,
            region: None,
            extra: HashMap::new(),
        }
    }

    /// Render this address back into its canonical URI form. Round
    /// trips through [`parse`] modulo default branch/region
    /// substitution, per the URI grammar.
    pub fn to_uri(&self) -> String {
        let key_suffix = match (&self.prefix, &self.object) {
            (Some(prefix), Some(object)) => format!("/{prefix}/{object}"),
            (Some(prefix), None) => format!("/{prefix}/"),
            (None, Some(object)) => format!("/{object}"),
            (None, None) => String::new(),
        };

        match self.provider {
            Provider::Oci => match (&self.namespace, &self.region) {
                (Some(ns), Some(region)) => {
                    format!("oci://{ns}@{region}/{}{key_suffix}", self.bucket)
                }
                (Some(ns), None) => format!("oci://{ns}@{}/{}{key_suffix}", default_region(), self.bucket),
                (None, _) => format!("oci://{}{key_suffix}", self.bucket),
            },
            Provider::Aws => match &self.region {
                Some(region) => format!("s3://{}@{region}{key_suffix}", self.bucket),
                None => format!("s3://{}{key_suffix}", self.bucket),
            },
            Provider::Gcp | Provider::Memory => {
                format!("{}://{}{key_suffix}", self.provider.scheme(), self.bucket)
            }
            Provider::Azure => {
                let account = self.extra.get("account").cloned().unwrap_or_default();
                format!("azure://{}@{account}{key_suffix}", self.bucket)
            }
            Provider::Github => {
                let reference = self.extra.get("ref").cloned().unwrap_or_else(default_ref);
                format!("github://{}@{reference}{key_suffix}", self.bucket)
            }
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_ref() -> String {
    "main".to_string()
}

/// Split a key into `(object, prefix)` per the tie-break rule: a key
/// with no trailing `/` names an object (the final segment) under a
/// prefix (everything before it); a trailing `/`, or an empty key,
/// names only a prefix (or nothing at all).
fn split_object_prefix(key: &str) -> (Option<String>, Option<String>) {
    if key.is_empty() {
        return (None, None);
    }
    if let Some(stripped) = key.strip_suffix('/') {
        if stripped.is_empty() {
            return (None, None);
        }
        return (None, Some(stripped.to_string()));
    }
    match key.rsplit_once('/') {
        Some((prefix, object)) => (Some(object.to_string()), Some(prefix.to_string())),
        None => (Some(key.to_string()), None),
    }
}

fn decode(s: &str, uri: &str) -> Result<String> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|e| Error::invalid_path("parse_uri", uri).with_source(e))
}

/// Parse `uri` into an [`Address`]. Returns `InvalidPath` if the scheme
/// is unrecognized or the bucket/owner/repo are malformed.
pub fn parse(uri: &str) -> Result<Address> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::invalid_path("parse_uri", uri))?;

    let provider = Provider::from_scheme(scheme)
        .ok_or_else(|| Error::invalid_path("parse_uri", uri))?;

    if rest.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }

    let address = match provider {
        Provider::Oci => parse_oci(rest, uri)?,
        Provider::Aws => parse_s3(rest, uri)?,
        Provider::Gcp | Provider::Memory => parse_plain_bucket(provider, rest, uri)?,
        Provider::Azure => parse_azure(rest, uri)?,
        Provider::Github => parse_github(rest, uri)?,
    };

    Ok(address)
}

fn parse_oci(rest: &str, uri: &str) -> Result<Address> {
    // Long form: n/<namespace>/b/<bucket>/o/<key…>
    if let Some(tail) = rest.strip_prefix("n/") {
        let (namespace, tail) = tail.split_once("/b/").ok_or_else(|| Error::invalid_path("parse_uri", uri))?;
        let (bucket, tail) = match tail.split_once("/o/") {
            Some((bucket, key)) => (bucket, Some(key)),
            None => (tail, None),
        };
        if namespace.is_empty() || bucket.is_empty() {
            return Err(Error::invalid_path("parse_uri", uri));
        }
        let mut addr = Address::new(Provider::Oci, decode(bucket, uri)?);
        addr.namespace = Some(decode(namespace, uri)?);
        // The verbose `o/` form names a key list rather than a single
        // object identity -- the whole remainder is recorded as prefix.
        if let Some(key) = tail {
            if !key.is_empty() {
                addr.prefix = Some(decode(key, uri)?);
            }
        }
        return Ok(addr);
    }

    // Short forms: <namespace>@<region>/<bucket>(/<key…>)? or <bucket>(/<key…>)?
    let (head, key) = rest.split_once('/').unwrap_or((rest, ""));
    let (namespace_region, bucket_if_ns_form) = (head, ());
    let _ = bucket_if_ns_form;

    if let Some((namespace, region)) = namespace_region.split_once('@') {
        if namespace.is_empty() || region.is_empty() {
            return Err(Error::invalid_path("parse_uri", uri));
        }
        let (bucket, key) = key.split_once('/').unwrap_or((key, ""));
        if bucket.is_empty() {
            return Err(Error::invalid_path("parse_uri", uri));
        }
        let mut addr = Address::new(Provider::Oci, decode(bucket, uri)?);
        addr.namespace = Some(decode(namespace, uri)?);
        addr.region = Some(decode(region, uri)?);
        let (object, prefix) = split_object_prefix(&decode(key, uri)?);
        addr.object = object;
        addr.prefix = prefix;
        return Ok(addr);
    }

    // Bare bucket(/key…) form, no namespace.
    let bucket = head;
    if bucket.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }
    let mut addr = Address::new(Provider::Oci, decode(bucket, uri)?);
    let (object, prefix) = split_object_prefix(&decode(key, uri)?);
    addr.object = object;
    addr.prefix = prefix;
    Ok(addr)
}

fn parse_s3(rest: &str, uri: &str) -> Result<Address> {
    let (head, key) = rest.split_once('/').unwrap_or((rest, ""));
    let (bucket, region) = match head.split_once('@') {
        Some((bucket, region)) => (bucket, Some(region)),
        None => (head, None),
    };
    if bucket.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }
    let mut addr = Address::new(Provider::Aws, decode(bucket, uri)?);
    if let Some(region) = region {
        if region.is_empty() {
            return Err(Error::invalid_path("parse_uri", uri));
        }
        addr.region = Some(decode(region, uri)?);
    }
    let (object, prefix) = split_object_prefix(&decode(key, uri)?);
    addr.object = object;
    addr.prefix = prefix;
    Ok(addr)
}

fn parse_plain_bucket(provider: Provider, rest: &str, uri: &str) -> Result<Address> {
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }
    let mut addr = Address::new(provider, decode(bucket, uri)?);
    let (object, prefix) = split_object_prefix(&decode(key, uri)?);
    addr.object = object;
    addr.prefix = prefix;
    Ok(addr)
}

fn parse_azure(rest: &str, uri: &str) -> Result<Address> {
    let (head, key) = rest.split_once('/').unwrap_or((rest, ""));
    let (container, account) = head.split_once('@').ok_or_else(|| Error::invalid_path("parse_uri", uri))?;
    if container.is_empty() || account.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }
    let mut addr = Address::new(Provider::Azure, decode(container, uri)?);
    addr.extra.insert("account".to_string(), decode(account, uri)?);
    let (object, prefix) = split_object_prefix(&decode(key, uri)?);
    addr.object = object;
    addr.prefix = prefix;
    Ok(addr)
}

fn parse_github(rest: &str, uri: &str) -> Result<Address> {
    let mut parts = rest.splitn(3, '/');
    let owner = parts.next().unwrap_or_default();
    let repo_and_ref = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    if owner.is_empty() || repo_and_ref.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }

    let (repo, reference) = match repo_and_ref.split_once('@') {
        Some((repo, reference)) => (repo, reference.to_string()),
        None => (repo_and_ref, default_ref()),
    };
    if repo.is_empty() || reference.is_empty() {
        return Err(Error::invalid_path("parse_uri", uri));
    }

    let bucket = format!("{}/{}", decode(owner, uri)?, decode(repo, uri)?);
    let mut addr = Address::new(Provider::Github, bucket);
    addr.extra.insert("owner".to_string(), decode(owner, uri)?);
    addr.extra.insert("repo".to_string(), decode(repo, uri)?);
    addr.extra.insert("ref".to_string(), decode(&reference, uri)?);
    let (object, prefix) = split_object_prefix(&decode(path, uri)?);
    addr.object = object;
    addr.prefix = prefix;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3_uri() {
        let addr = parse("s3://my-bucket/path/to/object.bin").unwrap();
        assert_eq!(addr.provider, Provider::Aws);
        assert_eq!(addr.bucket, "my-bucket");
        assert_eq!(addr.object.as_deref(), Some("object.bin"));
        assert_eq!(addr.prefix.as_deref(), Some("path/to"));
    }

    #[test]
    fn parses_s3_uri_with_region_suffix() {
        let addr = parse("s3://my-bucket@us-west-2/key").unwrap();
        assert_eq!(addr.bucket, "my-bucket");
        assert_eq!(addr.region.as_deref(), Some("us-west-2"));
        assert_eq!(addr.object.as_deref(), Some("key"));
    }

    #[test]
    fn parses_gs_uri() {
        let addr = parse("gs://bucket/key").unwrap();
        assert_eq!(addr.provider, Provider::Gcp);
        assert_eq!(addr.object.as_deref(), Some("key"));
    }

    #[test]
    fn parses_azure_uri() {
        let addr = parse("azure://mycontainer@myaccount/a/b.bin").unwrap();
        assert_eq!(addr.bucket, "mycontainer");
        assert_eq!(addr.extra.get("account").map(String::as_str), Some("myaccount"));
        assert_eq!(addr.object.as_deref(), Some("b.bin"));
        assert_eq!(addr.prefix.as_deref(), Some("a"));
    }

    #[test]
    fn rejects_azure_uri_without_account() {
        assert!(parse("azure://containeronly/key").is_err());
    }

    #[test]
    fn parses_oci_namespaced_dialect_a() {
        let addr = parse("oci://ns@us-ashburn-1/buck/a/b/c.txt").unwrap();
        assert_eq!(addr.provider, Provider::Oci);
        assert_eq!(addr.namespace.as_deref(), Some("ns"));
        assert_eq!(addr.region.as_deref(), Some("us-ashburn-1"));
        assert_eq!(addr.bucket, "buck");
        assert_eq!(addr.object.as_deref(), Some("c.txt"));
        assert_eq!(addr.prefix.as_deref(), Some("a/b"));
    }

    #[test]
    fn parses_oci_namespaced_dialect_b() {
        let addr = parse("oci://n/ns/b/buck/o/a/b/c.txt").unwrap();
        assert_eq!(addr.provider, Provider::Oci);
        assert_eq!(addr.namespace.as_deref(), Some("ns"));
        assert_eq!(addr.region, None);
        assert_eq!(addr.bucket, "buck");
        assert_eq!(addr.prefix.as_deref(), Some("a/b/c.txt"));
        assert_eq!(addr.object, None);
    }

    #[test]
    fn parses_oci_bare_bucket_form() {
        let addr = parse("oci://buck/key").unwrap();
        assert_eq!(addr.namespace, None);
        assert_eq!(addr.bucket, "buck");
        assert_eq!(addr.object.as_deref(), Some("key"));
    }

    #[test]
    fn parses_github_uri_with_default_ref() {
        let addr = parse("github://owner/repo/models/weights.bin").unwrap();
        assert_eq!(addr.bucket, "owner/repo");
        assert_eq!(addr.extra.get("ref").map(String::as_str), Some("main"));
        assert_eq!(addr.object.as_deref(), Some("weights.bin"));
        assert_eq!(addr.prefix.as_deref(), Some("models"));
    }

    #[test]
    fn parses_github_uri_with_explicit_ref() {
        let addr = parse("github://owner/repo@dev/models/weights.bin").unwrap();
        assert_eq!(addr.extra.get("ref").map(String::as_str), Some("dev"));
        assert_eq!(addr.extra.get("owner").map(String::as_str), Some("owner"));
        assert_eq!(addr.extra.get("repo").map(String::as_str), Some("repo"));
    }

    #[test]
    fn decodes_percent_escapes_in_key() {
        let addr = parse("s3://bucket/a%20b/c%2Bd").unwrap();
        assert_eq!(addr.object.as_deref(), Some("c+d"));
        assert_eq!(addr.prefix.as_deref(), Some("a b"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse("ftp://host/path").is_err());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(parse("not-a-uri").is_err());
    }

    #[test]
    fn roundtrips_s3_uri() {
        let addr = parse("s3://bucket/key").unwrap();
        let reparsed = parse(&addr.to_uri()).unwrap();
        assert_eq!(addr, reparsed);
    }

    #[test]
    fn roundtrips_oci_namespaced_uri() {
        let addr = parse("oci://ns@us-ashburn-1/buck/a/b/c.txt").unwrap();
        let reparsed = parse(&addr.to_uri()).unwrap();
        assert_eq!(addr, reparsed);
    }

    #[test]
    fn roundtrips_github_uri() {
        let addr = parse("github://owner/repo@dev/models/weights.bin").unwrap();
        let reparsed = parse(&addr.to_uri()).unwrap();
        assert_eq!(addr, reparsed);
    }
}
