//! Object keys and read access to the watch cache

use std::sync::Arc;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};

use csr_signer_common::{Error, Result};

/// Queue key of an object: `namespace/name`, or `name` when cluster-scoped
///
/// Returns `None` for an object without a name.
pub fn object_key(meta: &ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
    Some(match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    })
}

/// Split a queue key into `(namespace, name)`
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let invalid = || Error::InvalidKey {
        key: key.to_string(),
    };
    match key.split_once('/') {
        None if !key.is_empty() => Ok((None, key)),
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((Some(ns), name))
        }
        _ => Err(invalid()),
    }
}

/// Point reads by key against the local object cache
#[cfg_attr(test, mockall::automock)]
pub trait CsrLister: Send + Sync {
    /// The cached object for `key`, or `None` if it is not in the cache
    fn get(&self, key: &str) -> Result<Option<Arc<CertificateSigningRequest>>>;
}

impl CsrLister for Store<CertificateSigningRequest> {
    fn get(&self, key: &str) -> Result<Option<Arc<CertificateSigningRequest>>> {
        let (namespace, name) = split_key(key)?;
        let mut reference = ObjectRef::new(name);
        if let Some(ns) = namespace {
            reference = reference.within(ns);
        }
        Ok(Store::get(self, &reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;

    fn csr(name: &str) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn cluster_scoped_key_is_name() {
        let meta = ObjectMeta {
            name: Some("web".to_string()),
            ..Default::default()
        };
        assert_eq!(object_key(&meta).as_deref(), Some("web"));
    }

    #[test]
    fn namespaced_key_includes_namespace() {
        let meta = ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("prod".to_string()),
            ..Default::default()
        };
        assert_eq!(object_key(&meta).as_deref(), Some("prod/web"));
    }

    #[test]
    fn unnamed_object_has_no_key() {
        assert_eq!(object_key(&ObjectMeta::default()), None);
    }

    #[test]
    fn split_key_forms() {
        assert_eq!(split_key("web").unwrap(), (None, "web"));
        assert_eq!(split_key("prod/web").unwrap(), (Some("prod"), "web"));
        assert!(split_key("").is_err());
        assert!(split_key("/web").is_err());
        assert!(split_key("a/b/c").is_err());
    }

    #[test]
    fn store_lookup_by_key() {
        let mut writer: Writer<CertificateSigningRequest> = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Apply(csr("web")));
        let store = writer.as_reader();

        let found = CsrLister::get(&store, "web").expect("key should parse");
        assert_eq!(
            found.and_then(|c| c.metadata.name.clone()).as_deref(),
            Some("web")
        );
        assert!(CsrLister::get(&store, "missing")
            .expect("key should parse")
            .is_none());
        assert!(CsrLister::get(&store, "a/b/c").is_err());
    }
}
