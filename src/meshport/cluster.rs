use std::collections::BTreeMap;

use anyhow::Context;
use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kube::{
    api::{Api, DeleteParams, PostParams},
    Client, CustomResource,
};
use serde::{Deserialize, Serialize};

use crate::meshport::config::{KubernetesConfig, RouteConfig, RouteKind};

const ROUTE_SERVICE_NAME: &str = "meshport-route-service";
const DEFAULT_INGRESS_NAME: &str = "meshport-route-ingress";
const CERTIFICATE_NAME: &str = "meshport-route-certificate";
const TLS_SECRET_NAME: &str = "meshport-certificate";
const CLUSTER_ISSUER: &str = "letsencrypt-prod";
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// cert-manager Certificate resource. The CRD itself is installed by
/// cert-manager, so schema generation is disabled.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerRef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
}

/// Projects the authoritative route set into cluster objects: a LoadBalancer
/// Service for TCP/UDP routes, an Ingress plus a cert-manager Certificate for
/// HTTP routes. Every projection is fetch-then-create-or-overwrite and deletes
/// the object once its desired spec is empty, so repeated reconciles converge.
pub struct ClusterReconciler {
    client: Client,
    namespace: String,
    ingress_name: String,
    service_name: String,
    ingress_class: String,
}

impl ClusterReconciler {
    pub async fn new(cfg: &KubernetesConfig) -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("cluster: build kubernetes client")?;

        // Inside a pod the mounted service account wins over the config.
        let namespace = current_namespace().unwrap_or_else(|| cfg.namespace.clone());

        let ingress_name = if cfg.ingress_name.trim().is_empty() {
            DEFAULT_INGRESS_NAME.to_string()
        } else {
            cfg.ingress_name.clone()
        };

        Ok(Self {
            client,
            namespace,
            ingress_name,
            service_name: cfg.service_name.clone(),
            ingress_class: cfg.ingress_class.clone(),
        })
    }

    /// Errors are logged per object; one failed projection never blocks the
    /// others or the caller's mutation.
    pub async fn reconcile(&self, routes: &[RouteConfig]) {
        if let Err(err) = self.apply_service(routes).await {
            tracing::warn!(err = %err, "cluster: service reconcile failed");
        }
        if let Err(err) = self.apply_ingress(routes).await {
            tracing::warn!(err = %err, "cluster: ingress reconcile failed");
        }
        if let Err(err) = self.apply_certificate(routes).await {
            tracing::warn!(err = %err, "cluster: certificate reconcile failed");
        }
    }

    async fn apply_service(&self, routes: &[RouteConfig]) -> anyhow::Result<()> {
        let desired = build_service(&self.namespace, &self.service_name, routes);
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);

        let has_ports = desired
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .is_some_and(|p| !p.is_empty());
        if !has_ports {
            return delete_if_exists(&api, ROUTE_SERVICE_NAME).await;
        }

        match api.get(ROUTE_SERVICE_NAME).await {
            Ok(mut existing) => {
                existing.spec = desired.spec.clone();
                api.replace(ROUTE_SERVICE_NAME, &PostParams::default(), &existing)
                    .await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &desired).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn apply_ingress(&self, routes: &[RouteConfig]) -> anyhow::Result<()> {
        let desired = build_ingress(
            &self.namespace,
            &self.ingress_name,
            &self.service_name,
            &self.ingress_class,
            routes,
        );
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);

        let has_rules = desired
            .spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .is_some_and(|r| !r.is_empty());
        if !has_rules {
            return delete_if_exists(&api, &self.ingress_name).await;
        }

        match api.get(&self.ingress_name).await {
            Ok(mut existing) => {
                existing.spec = desired.spec.clone();
                api.replace(&self.ingress_name, &PostParams::default(), &existing)
                    .await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &desired).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn apply_certificate(&self, routes: &[RouteConfig]) -> anyhow::Result<()> {
        let desired = build_certificate(&self.namespace, routes);
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), &self.namespace);

        if desired.spec.dns_names.is_empty() {
            return delete_if_exists(&api, CERTIFICATE_NAME).await;
        }

        match api.get(CERTIFICATE_NAME).await {
            Ok(mut existing) => {
                existing.spec = desired.spec.clone();
                api.replace(CERTIFICATE_NAME, &PostParams::default(), &existing)
                    .await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &desired).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> anyhow::Result<()>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn current_namespace() -> Option<String> {
    let ns = std::fs::read_to_string(NAMESPACE_FILE).ok()?;
    let ns = ns.trim();
    if ns.is_empty() {
        None
    } else {
        Some(ns.to_string())
    }
}

fn build_service(namespace: &str, app: &str, routes: &[RouteConfig]) -> Service {
    let ports: Vec<ServicePort> = routes
        .iter()
        .filter(|r| r.kind.is_network())
        .map(|r| ServicePort {
            name: Some(format!("{}-{}", r.kind, r.port)),
            port: i32::from(r.port),
            target_port: Some(IntOrString::Int(i32::from(r.port))),
            protocol: Some(
                match r.kind {
                    RouteKind::Udp => "UDP",
                    _ => "TCP",
                }
                .to_string(),
            ),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: ObjectMeta {
            name: Some(ROUTE_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_ingress(
    namespace: &str,
    name: &str,
    backend_service: &str,
    ingress_class: &str,
    routes: &[RouteConfig],
) -> Ingress {
    let mut rules = Vec::new();
    let mut tls = Vec::new();

    for route in routes.iter().filter(|r| r.kind.is_http()) {
        rules.push(IngressRule {
            host: Some(route.name.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: backend_service.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(80),
                                name: None,
                            }),
                        }),
                        resource: None,
                    },
                }],
            }),
        });
        tls.push(IngressTLS {
            hosts: Some(vec![route.name.clone()]),
            secret_name: Some(TLS_SECRET_NAME.to_string()),
        });
    }

    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(ingress_class.to_string()),
            rules: Some(rules),
            tls: Some(tls),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_certificate(namespace: &str, routes: &[RouteConfig]) -> Certificate {
    let dns_names: Vec<String> = routes
        .iter()
        .filter(|r| r.kind.is_http())
        .map(|r| r.name.clone())
        .collect();

    let mut cert = Certificate::new(
        CERTIFICATE_NAME,
        CertificateSpec {
            secret_name: TLS_SECRET_NAME.to_string(),
            dns_names,
            issuer_ref: IssuerRef {
                name: CLUSTER_ISSUER.to_string(),
                kind: "ClusterIssuer".to_string(),
            },
        },
    );
    cert.metadata.namespace = Some(namespace.to_string());
    cert
}
