//! Secret binding of the object port: a single byte-map payload plus a type
//! field carried over on install.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;

use ditto_core::{AnnotationMap, Meta};
use ditto_engine::{ActionError, ObjectActions};

use crate::{action_error, meta_view, object_meta};

pub struct SecretActions {
    client: Client,
}

impl SecretActions {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn replace(&self, secret: Secret) -> Result<Secret, ActionError> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.api(&namespace)
            .replace(&name, &PostParams::default(), &secret)
            .await
            .map_err(action_error)
    }
}

#[async_trait]
impl ObjectActions for SecretActions {
    type Object = Secret;

    fn meta(&self, object: &Secret) -> Meta {
        meta_view(&object.metadata)
    }

    async fn update(
        &self,
        object: &Secret,
        source: &Secret,
        annotations: AnnotationMap,
    ) -> Result<Secret, ActionError> {
        let mut secret = object.clone();
        secret.metadata.annotations = Some(annotations);
        secret.data = source.data.clone();
        // stringData is a write-only convenience; never carry it over
        secret.string_data = None;
        self.replace(secret).await
    }

    async fn clear(
        &self,
        object: &Secret,
        annotations: AnnotationMap,
    ) -> Result<Secret, ActionError> {
        let mut secret = object.clone();
        secret.metadata.annotations = Some(annotations);
        secret.data = None;
        secret.string_data = None;
        self.replace(secret).await
    }

    async fn install(
        &self,
        meta: Meta,
        source: &Secret,
        data: Option<&Secret>,
    ) -> Result<Secret, ActionError> {
        let create = meta.resource_version.is_empty();
        let mut secret = Secret {
            metadata: object_meta(meta),
            type_: source.type_.clone(),
            ..Default::default()
        };
        if let Some(data_object) = data {
            secret.data = data_object.data.clone();
        }
        if create {
            let namespace = secret.metadata.namespace.clone().unwrap_or_default();
            self.api(&namespace)
                .create(&PostParams::default(), &secret)
                .await
                .map_err(action_error)
        } else {
            self.replace(secret).await
        }
    }

    async fn delete(&self, object: &Secret) -> Result<(), ActionError> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: object.metadata.resource_version.clone(),
                uid: None,
            }),
            ..Default::default()
        };
        self.api(&namespace)
            .delete(&name, &params)
            .await
            .map(|_| ())
            .map_err(action_error)
    }
}
