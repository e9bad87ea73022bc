mod migration;
pub mod types;

use std::sync::Arc;

use jsonrpsee::RpcModule;

use crate::service::Relay;

pub fn rpc_module(relay: Arc<Relay>) -> RpcModule<Arc<Relay>> {
    migration::rpc_module(relay)
}

/// Returns an `RpcModule<Arc<Relay>>`. Call with the following syntax:
/// ```ignore
/// declare_module!(
///     relay,
///     [
///         ("method1", method_one),
///         ("method2", method_two),
///     ],
/// )
/// ```
///
/// where `relay` is an `Arc<Relay>` and each implementation method has the signature
/// `async fn(jsonrpsee::types::Params<'static>, &Relay) -> RelayResult<T>`.
///
/// Will panic if any of the method names collide.
macro_rules! declare_module {
    (
        $relay:expr,
        [ $(($name:expr, $method:expr)),* $(,)? ] $(,)?
    ) => {{
        let mut module: jsonrpsee::RpcModule<std::sync::Arc<crate::service::Relay>> =
            jsonrpsee::RpcModule::new($relay);
        let meter = opentelemetry::global::meter("");

        $(
            let rpc_server_duration = meter
                .f64_histogram("rpc.server.duration")
                .with_unit("ms")
                .build();
            module
                .register_async_method($name, move |params, context, _| {
                    let rpc_server_duration = rpc_server_duration.clone();
                    async move {
                        let mut attributes = vec![
                            opentelemetry::KeyValue::new("rpc.system", "jsonrpc"),
                            opentelemetry::KeyValue::new("rpc.service", "relay"),
                            opentelemetry::KeyValue::new("rpc.method", $name),
                            opentelemetry::KeyValue::new("network.transport", "tcp"),
                            opentelemetry::KeyValue::new("rpc.jsonrpc.version", "2.0"),
                        ];

                        let start = std::time::Instant::now();

                        let result: crate::error::RelayResult<_> = $method(params, &context).await;
                        let result = result.map_err(|e| {
                            match &e {
                                crate::error::RelayError::ChainCall { .. }
                                | crate::error::RelayError::Storage(_) => tracing::error!(method = $name, %e),
                                _ => tracing::debug!(method = $name, %e),
                            }
                            jsonrpsee::types::ErrorObjectOwned::from(e)
                        });
                        if let Err(err) = &result {
                            attributes.push(opentelemetry::KeyValue::new(
                                "rpc.jsonrpc.error_code",
                                err.code() as i64,
                            ));
                        }
                        rpc_server_duration.record(start.elapsed().as_secs_f64() * 1000.0, &attributes);
                        result
                    }
                })
                .unwrap();
        )*

        module
    }}
}

use declare_module;
