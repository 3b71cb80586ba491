use std::ops::{Deref, DerefMut};

use crate::{
    connection::Builder,
    endpoint::{ConnectionId, EndpointState, LinkId, SessionId},
    error::Error,
    handler::Handler,
    types,
};

use super::Reactor;

/// A reactor whose connections share one container id
///
/// Adds shortcuts that create and open sessions and links with generated names.
#[derive(Debug)]
pub struct Container {
    reactor: Reactor,
    container_id: String,
    link_counter: u64,
}

impl Deref for Container {
    type Target = Reactor;

    fn deref(&self) -> &Self::Target {
        &self.reactor
    }
}

impl DerefMut for Container {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reactor
    }
}

impl Container {
    /// Creates a container around a reactor without handlers
    pub fn new(container_id: impl Into<String>) -> Self {
        Self::with_reactor(container_id, Reactor::new())
    }

    /// Creates a container around an existing reactor
    pub fn with_reactor(container_id: impl Into<String>, reactor: Reactor) -> Self {
        Self {
            reactor,
            container_id: container_id.into(),
            link_counter: 0,
        }
    }

    /// The container id
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Consumes the container and returns its reactor
    pub fn into_reactor(self) -> Reactor {
        self.reactor
    }

    /// Creates and opens a connection carrying the container id
    pub fn connection(&mut self, handler: Option<Box<dyn Handler>>) -> ConnectionId {
        let builder = self.builder();
        let id = self.reactor.connection_with(builder, handler);
        if let Some(conn) = self.reactor.connection_mut(id) {
            conn.open();
        }
        id
    }

    /// Connects over TCP and opens a connection carrying the container id
    #[cfg(feature = "net")]
    pub async fn connect(
        &mut self,
        addr: impl tokio::net::ToSocketAddrs,
        handler: Option<Box<dyn Handler>>,
    ) -> Result<ConnectionId, super::Error> {
        let builder = self.builder();
        let id = self.reactor.connect(addr, builder, handler).await?;
        if let Some(conn) = self.reactor.connection_mut(id) {
            conn.open();
        }
        Ok(id)
    }

    /// Returns the first locally open session of the connection, creating and
    /// opening one if there is none
    pub fn create_session(&mut self, connection: ConnectionId) -> Result<SessionId, Error> {
        let conn = self
            .reactor
            .connection_mut(connection)
            .ok_or(Error::NotFound)?;
        if let Some(session) = conn.session_head(EndpointState::LOCAL_ACTIVE) {
            return Ok(session);
        }
        let session = conn.create_session();
        conn.open_session(session)?;
        Ok(session)
    }

    /// Creates and opens a sender to `target`. A name is generated if none is
    /// given.
    pub fn create_sender(
        &mut self,
        connection: ConnectionId,
        target: impl Into<String>,
        source: Option<String>,
        name: Option<String>,
    ) -> Result<LinkId, Error> {
        let session = self.create_session(connection)?;
        let name = self.link_name(name);
        let conn = self
            .reactor
            .connection_mut(connection)
            .ok_or(Error::NotFound)?;
        let link = conn.create_sender(session, name)?;
        conn.set_target(link, types::target(target))?;
        if let Some(source) = source {
            conn.set_source(link, types::source(source))?;
        }
        conn.open_link(link)?;
        Ok(link)
    }

    /// Creates and opens a receiver from `source`. A name is generated if none
    /// is given.
    pub fn create_receiver(
        &mut self,
        connection: ConnectionId,
        source: impl Into<String>,
        target: Option<String>,
        name: Option<String>,
    ) -> Result<LinkId, Error> {
        let session = self.create_session(connection)?;
        let name = self.link_name(name);
        let conn = self
            .reactor
            .connection_mut(connection)
            .ok_or(Error::NotFound)?;
        let link = conn.create_receiver(session, name)?;
        conn.set_source(link, types::source(source))?;
        if let Some(target) = target {
            conn.set_target(link, types::target(target))?;
        }
        conn.open_link(link)?;
        Ok(link)
    }

    fn builder(&self) -> Builder {
        Builder::new().container_id(self.container_id.clone())
    }

    fn link_name(&mut self, name: Option<String>) -> String {
        name.unwrap_or_else(|| {
            self.link_counter += 1;
            format!("{}-{}", self.container_id, self.link_counter)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::endpoint::LocalState;

    use super::Container;

    #[test]
    fn sender_and_receiver_share_the_open_session() {
        let mut container = Container::new("container");
        let conn = container.connection(None);
        let sender = container
            .create_sender(conn, "queue", None, None)
            .unwrap();
        let receiver = container
            .create_receiver(conn, "queue", None, Some("named".into()))
            .unwrap();

        let c = container.get_connection(conn).unwrap();
        assert_eq!(c.container_id(), "container");
        assert_eq!(c.state().local(), LocalState::Active);

        let sender = c.get_link(sender).unwrap();
        let receiver = c.get_link(receiver).unwrap();
        assert_eq!(sender.name(), "container-1");
        assert_eq!(receiver.name(), "named");
        assert_eq!(sender.session(), receiver.session());
        assert_eq!(sender.state().local(), LocalState::Active);
        assert_eq!(
            sender.target().and_then(|t| t.address.as_deref()),
            Some("queue")
        );
    }
}
