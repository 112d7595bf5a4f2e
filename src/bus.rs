//! Thin adapter over the system message bus.
//!
//! The cellular daemon this appliance talks to exposes an oFono-shaped
//! API: objects under a tree of paths implement interfaces such as
//! `Modem`, `ConnectionContext`, `NetworkRegistration`, `MessageManager`,
//! each with a non-standard `GetProperties() -> a{sv}`, `SetProperty(s,v)`,
//! and a `PropertyChanged(s,v)` signal (not the freedesktop
//! `org.freedesktop.DBus.Properties` convention). `BusClient` wraps a
//! single `zbus::Connection` and exposes generic property and signal
//! helpers that every component (`Modem`, `DataBearer`, `SmsEngine`) builds
//! its own typed view on top of.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::instrument;
use zbus::Connection;
use zbus::fdo::DBusProxy;
use zbus::zvariant::OwnedValue;

/// Default bus method call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A `PropertyChanged` event forwarded from a bus subscription.
#[derive(Debug, Clone)]
pub struct PropertyChanged {
    /// Object path the signal was emitted from.
    pub path: String,
    /// Changed property name.
    pub name: String,
    /// New value.
    pub value: OwnedValue,
}

/// Whether the well-known bus name owning the modem service currently has
/// an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameOwnerEvent {
    /// The service appeared on the bus.
    Appeared,
    /// The service vanished from the bus.
    Vanished,
}

/// Errors from bus operations; these map to `AppError::Unavailable` at the
/// HTTP boundary (bus/modem daemon not reachable is not a fatal condition
/// here, it is the trigger for self-healing).
pub type BusResult<T> = Result<T, zbus::Error>;

/// Adapter over the system bus connection to the modem manager daemon.
///
/// The source holds one bus connection per
/// component; this crate instead holds a single shared `Connection` with
/// per-component subscription handles, which centralises reconnect logic.
#[derive(Clone)]
pub struct BusClient {
    connection: Connection,
    service_name: String,
    /// True once an initial successful call or a `NameOwnerChanged` appear
    /// event has been observed. Pure event-driven gating — no speculative
    /// "probably up" optimism.
    available: Arc<Mutex<bool>>,
}

impl BusClient {
    /// Connect to the system bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the system bus cannot be reached.
    pub async fn system(service_name: impl Into<String>) -> BusResult<Self> {
        let connection = Connection::system().await?;
        Ok(Self {
            connection,
            service_name: service_name.into(),
            available: Arc::new(Mutex::new(false)),
        })
    }

    /// Build a client over an already-established connection (used in
    /// tests against a private bus).
    #[must_use]
    pub fn with_connection(connection: Connection, service_name: impl Into<String>) -> Self {
        Self {
            connection,
            service_name: service_name.into(),
            available: Arc::new(Mutex::new(false)),
        }
    }

    /// Whether the modem service is currently believed to be reachable.
    pub async fn is_available(&self) -> bool {
        *self.available.lock().await
    }

    async fn mark_available(&self, available: bool) {
        *self.available.lock().await = available;
    }

    /// `GetProperties()` on an object implementing the oFono-style
    /// property interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails; marks the client unavailable
    /// only on a "no reply"/"service unknown" class of error, not on an
    /// application-level failure.
    #[instrument(skip(self))]
    pub async fn get_properties(
        &self,
        path: &str,
        interface: &str,
    ) -> BusResult<HashMap<String, OwnedValue>> {
        let proxy = zbus::Proxy::new(&self.connection, self.service_name.clone(), path.to_string(), interface.to_string())
            .await?;
        let result: BusResult<HashMap<String, OwnedValue>> = proxy
            .call_method("GetProperties", &())
            .await
            .and_then(|m| m.body().deserialize().map_err(zbus::Error::from));
        match &result {
            Ok(_) => self.mark_available(true).await,
            Err(e) if is_unreachable(e) => self.mark_available(false).await,
            Err(_) => {}
        }
        result
    }

    /// `SetProperty(name, value)` on an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    #[instrument(skip(self, value))]
    pub async fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: zbus::zvariant::Value<'_>,
    ) -> BusResult<()> {
        let proxy = zbus::Proxy::new(&self.connection, self.service_name.clone(), path.to_string(), interface.to_string())
            .await?;
        proxy.call_method("SetProperty", &(name, value)).await?;
        Ok(())
    }

    /// Invoke an arbitrary method and deserialize its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the reply cannot be decoded.
    pub async fn call_method<B, R>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: &B,
    ) -> BusResult<R>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
        R: serde::de::DeserializeOwned + zbus::zvariant::Type,
    {
        let proxy = zbus::Proxy::new(&self.connection, self.service_name.clone(), path.to_string(), interface.to_string())
            .await?;
        let reply = proxy.call_method(method, args).await?;
        reply.body().deserialize().map_err(zbus::Error::from)
    }

    /// Subscribe to `PropertyChanged(s, v)` on an object, forwarding each
    /// event onto an `mpsc` channel. The spawned task is the
    /// "single-threaded bus dispatcher": it never blocks on the
    /// receiver, only enqueues.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal stream cannot be established.
    pub async fn subscribe_property_changed(
        &self,
        path: &str,
        interface: &str,
    ) -> BusResult<mpsc::Receiver<PropertyChanged>> {
        let proxy = zbus::Proxy::new(&self.connection, self.service_name.clone(), path.to_string(), interface.to_string())
            .await?;
        let mut stream = proxy.receive_signal("PropertyChanged").await?;
        let (tx, rx) = mpsc::channel(32);
        let owned_path = path.to_string();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok((name, value)) = msg.body().deserialize::<(String, OwnedValue)>() else {
                    continue;
                };
                let event = PropertyChanged {
                    path: owned_path.clone(),
                    name,
                    value,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Subscribe to an arbitrary named signal on an object, forwarding the
    /// raw message onto an `mpsc` channel for the caller to decode. Used
    /// for signals whose argument shape isn't the uniform `(s, v)`
    /// `PropertyChanged` has, e.g. `MessageManager.IncomingMessage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal stream cannot be established.
    pub async fn subscribe_signal(
        &self,
        path: &str,
        interface: &str,
        signal_name: &'static str,
    ) -> BusResult<mpsc::Receiver<zbus::Message>> {
        let proxy = zbus::Proxy::new(&self.connection, self.service_name.clone(), path.to_string(), interface.to_string())
            .await?;
        let mut stream = proxy.receive_signal(signal_name).await?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Watch the modem service's well-known name for appear/vanish events.
    ///
    /// # Errors
    ///
    /// Returns an error if the `org.freedesktop.DBus` proxy cannot be
    /// built.
    pub async fn watch_name_owner(&self) -> BusResult<mpsc::Receiver<NameOwnerEvent>> {
        let dbus = DBusProxy::new(&self.connection).await?;
        let mut stream = dbus.receive_name_owner_changed().await?;
        let (tx, rx) = mpsc::channel(8);
        let watched = self.service_name.clone();
        let client = self.clone();

        tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else { continue };
                if args.name().as_str() != watched {
                    continue;
                }
                let event = if args.new_owner().is_some() {
                    client.mark_available(true).await;
                    NameOwnerEvent::Appeared
                } else {
                    client.mark_available(false).await;
                    NameOwnerEvent::Vanished
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// The well-known service name this client talks to.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

fn is_unreachable(err: &zbus::Error) -> bool {
    matches!(
        err,
        zbus::Error::MethodError(name, _, _) if name.as_str() == "org.freedesktop.DBus.Error.ServiceUnknown"
    ) || matches!(err, zbus::Error::InputOutput(_))
}

use futures_util::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::interface;

    struct TestModem {
        strength: u8,
    }

    #[interface(name = "org.cirrusd.test.Modem")]
    impl TestModem {
        fn get_properties(&self) -> HashMap<String, OwnedValue> {
            let mut props = HashMap::new();
            props.insert(
                "SignalStrength".to_string(),
                OwnedValue::try_from(i32::from(self.strength)).unwrap(),
            );
            props
        }
    }

    #[tokio::test]
    async fn get_properties_round_trips_over_a_private_bus() {
        let service_name = "org.cirrusd.test.BusClient1";
        let guard = zbus::connection::Builder::session()
            .unwrap()
            .name(service_name)
            .unwrap()
            .serve_at("/modem", TestModem { strength: 77 })
            .unwrap()
            .build()
            .await;
        let Ok(_server_conn) = guard else {
            // No session bus available in this sandbox; skip.
            return;
        };

        let client_conn = Connection::session().await.unwrap();
        let client = BusClient::with_connection(client_conn, service_name);

        let props = client
            .get_properties("/modem", "org.cirrusd.test.Modem")
            .await
            .unwrap();
        let strength: i32 = props.get("SignalStrength").unwrap().try_clone().unwrap().try_into().unwrap();
        assert_eq!(strength, 77);
        assert!(client.is_available().await);
    }

    #[test]
    fn name_owner_event_distinguishes_appear_and_vanish() {
        assert_ne!(NameOwnerEvent::Appeared, NameOwnerEvent::Vanished);
    }
}
