// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployed classes and their parametrised instances.
//!
//! A class is served by one "service function" named `"{class}.*"`; its
//! methods are invoked through that function with the method name set on
//! each input. Parametrised classes bind their constructor arguments first,
//! which yields a separate bound function id.

use std::collections::{BTreeMap, HashMap};

use modal_protocol::api::{self, DeploymentNamespace, ParameterSerializationFormat};
use tracing::{debug, instrument};

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::function::Function;
use crate::params::{ParamValue, encode_parameter_set};

/// A class deployed in an app.
#[derive(Debug, Clone)]
pub struct Cls {
    client: Client,
    ctx: Context,
    environment: String,
    service_function_id: String,
    schema: Vec<api::ClassParameterSpec>,
    // method name -> input-plane URL, if the method is served there
    methods: BTreeMap<String, Option<String>>,
}

impl Cls {
    /// Look up class `name` in app `app_name`.
    #[instrument(skip(client))]
    pub async fn lookup(
        client: &Client,
        app_name: &str,
        name: &str,
        environment: Option<&str>,
    ) -> Result<Self> {
        let ctx = client.context().clone();
        let environment = client.environment_name(environment);
        let response = client
            .control_plane()
            .function_get(
                &ctx,
                api::FunctionGetRequest {
                    app_name: app_name.to_string(),
                    object_tag: format!("{name}.*"),
                    namespace: DeploymentNamespace::Workspace as i32,
                    environment_name: environment.clone(),
                },
            )
            .await
            .map_err(|status| {
                SdkError::not_found_or(status, || format!("class '{app_name}/{name}' not found"))
            })?;

        let metadata = response.handle_metadata.unwrap_or_default();

        let parameter_info = metadata.class_parameter_info.unwrap_or_default();
        if !parameter_info.schema.is_empty()
            && parameter_info.format() != ParameterSerializationFormat::Proto
        {
            return Err(SdkError::Invalid(format!(
                "unsupported parameter format: {:?}",
                parameter_info.format()
            )));
        }

        if metadata.method_handle_metadata.is_empty() {
            return Err(SdkError::Invalid(
                "classes require deployments made with client v0.67 or later".to_string(),
            ));
        }
        let methods = metadata
            .method_handle_metadata
            .into_iter()
            .map(|(method, handle)| (method, handle.input_plane_url.filter(|u| !u.is_empty())))
            .collect();

        Ok(Self {
            client: client.clone(),
            ctx,
            environment,
            service_function_id: response.function_id,
            schema: parameter_info.schema,
            methods,
        })
    }

    /// Names of the class's methods, sorted.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Create an instance with `params` bound to the constructor.
    ///
    /// Classes without parameters ignore `params` and share one instance.
    #[instrument(skip(self, params), fields(service_function_id = %self.service_function_id))]
    pub async fn instance(&self, params: HashMap<String, ParamValue>) -> Result<ClsInstance> {
        let function_id = if self.schema.is_empty() {
            self.service_function_id.clone()
        } else {
            self.bind_parameters(&params).await?
        };

        let methods = self
            .methods
            .iter()
            .map(|(name, input_plane_url)| {
                let function = Function::from_parts(
                    &self.client,
                    &self.ctx,
                    function_id.clone(),
                    Some(name.clone()),
                    input_plane_url.clone(),
                );
                (name.clone(), function)
            })
            .collect();

        Ok(ClsInstance { methods })
    }

    async fn bind_parameters(&self, params: &HashMap<String, ParamValue>) -> Result<String> {
        let serialized_params = encode_parameter_set(&self.schema, params)?;
        let response = self
            .client
            .control_plane()
            .function_bind_params(
                &self.ctx,
                api::FunctionBindParamsRequest {
                    function_id: self.service_function_id.clone(),
                    serialized_params,
                    environment_name: self.environment.clone(),
                },
            )
            .await?;
        debug!(bound_function_id = %response.bound_function_id, "parameters bound");
        Ok(response.bound_function_id)
    }
}

/// A class instance; each method is a [`Function`].
#[derive(Debug, Clone)]
pub struct ClsInstance {
    methods: BTreeMap<String, Function>,
}

impl ClsInstance {
    pub fn method(&self, name: &str) -> Result<Function> {
        self.methods
            .get(name)
            .cloned()
            .ok_or_else(|| SdkError::NotFound(format!("method '{name}' not found on class")))
    }
}
