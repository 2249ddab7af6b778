//! Config map binding of the object port: two payloads, a string map and a
//! byte map.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;

use ditto_core::{AnnotationMap, Meta};
use ditto_engine::{ActionError, ObjectActions};

use crate::{action_error, meta_view, object_meta};

pub struct ConfigMapActions {
    client: Client,
}

impl ConfigMapActions {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn replace(&self, config_map: ConfigMap) -> Result<ConfigMap, ActionError> {
        let namespace = config_map.metadata.namespace.clone().unwrap_or_default();
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.api(&namespace)
            .replace(&name, &PostParams::default(), &config_map)
            .await
            .map_err(action_error)
    }
}

#[async_trait]
impl ObjectActions for ConfigMapActions {
    type Object = ConfigMap;

    fn meta(&self, object: &ConfigMap) -> Meta {
        meta_view(&object.metadata)
    }

    async fn update(
        &self,
        object: &ConfigMap,
        source: &ConfigMap,
        annotations: AnnotationMap,
    ) -> Result<ConfigMap, ActionError> {
        let mut config_map = object.clone();
        config_map.metadata.annotations = Some(annotations);
        config_map.data = source.data.clone();
        config_map.binary_data = source.binary_data.clone();
        self.replace(config_map).await
    }

    async fn clear(
        &self,
        object: &ConfigMap,
        annotations: AnnotationMap,
    ) -> Result<ConfigMap, ActionError> {
        let mut config_map = object.clone();
        config_map.metadata.annotations = Some(annotations);
        config_map.data = None;
        config_map.binary_data = None;
        self.replace(config_map).await
    }

    async fn install(
        &self,
        meta: Meta,
        _source: &ConfigMap,
        data: Option<&ConfigMap>,
    ) -> Result<ConfigMap, ActionError> {
        let create = meta.resource_version.is_empty();
        let mut config_map = ConfigMap {
            metadata: object_meta(meta),
            ..Default::default()
        };
        if let Some(data_object) = data {
            config_map.data = data_object.data.clone();
            config_map.binary_data = data_object.binary_data.clone();
        }
        if create {
            let namespace = config_map.metadata.namespace.clone().unwrap_or_default();
            self.api(&namespace)
                .create(&PostParams::default(), &config_map)
                .await
                .map_err(action_error)
        } else {
            self.replace(config_map).await
        }
    }

    async fn delete(&self, object: &ConfigMap) -> Result<(), ActionError> {
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
