//! Operator admin credentials
//!
//! Generated once when the cluster is first reconciled and never rotated.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::controller::normalize::ClusterSpec;
use crate::resources::common::{owner_reference, standard_labels};

/// Username of the operator admin account
pub const ADMIN_USERNAME: &str = "root";

const PASSWORD_LENGTH: usize = 32;

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

pub fn admin_secret_name(cluster_name: &str) -> String {
    format!("{}-admin-credentials", cluster_name)
}

/// Generate the admin credentials Secret
pub fn generate_admin_secret(spec: &ClusterSpec) -> Secret {
    let string_data = BTreeMap::from([
        ("username".to_string(), ADMIN_USERNAME.to_string()),
        ("password".to_string(), generate_password(PASSWORD_LENGTH)),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(admin_secret_name(&spec.name)),
            namespace: Some(spec.namespace.clone()),
            labels: Some(standard_labels(&spec.name)),
            owner_references: Some(vec![owner_reference(spec)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}
