//! Deliveries, dispositions and settlement

use std::fmt;

use bytes::BytesMut;

use crate::{
    endpoint::{DeliveryId, LinkId},
    error::Error,
    event::{Event, EventType},
    types::{
        definitions::{DeliveryNumber, DeliveryTag, Role},
        messaging::DeliveryState,
    },
    Connection,
};

/// One message transfer on a link
#[derive(Debug)]
pub struct Delivery {
    pub(crate) id: DeliveryId,
    pub(crate) link: LinkId,
    pub(crate) role: Role,
    pub(crate) tag: DeliveryTag,
    pub(crate) local: Option<DeliveryState>,
    pub(crate) remote: Option<DeliveryState>,
    pub(crate) settled: bool,
    pub(crate) remote_settled: bool,
    pub(crate) updated: bool,

    /// Outgoing bytes not yet framed, or incoming bytes not yet read
    pub(crate) data: BytesMut,
    pub(crate) partial: bool,
    pub(crate) aborted: bool,
    /// The application is done with the delivery as the current one
    pub(crate) advanced: bool,
    /// Credit has been consumed for this outgoing delivery
    pub(crate) issued: bool,
    /// Wire delivery id, assigned by the first transfer frame
    pub(crate) number: Option<DeliveryNumber>,
    /// The transfer frame with `more=false` has been written
    pub(crate) transfer_complete: bool,
    pub(crate) disposition_pending: bool,
    pub(crate) settle_sent: bool,

    pub(crate) in_work: bool,
    pub(crate) in_tpwork: bool,
}

impl Delivery {
    pub(crate) fn new(id: DeliveryId, link: LinkId, role: Role, tag: DeliveryTag) -> Self {
        Self {
            id,
            link,
            role,
            tag,
            local: None,
            remote: None,
            settled: false,
            remote_settled: false,
            updated: false,
            data: BytesMut::new(),
            partial: false,
            aborted: false,
            advanced: false,
            issued: false,
            number: None,
            transfer_complete: false,
            disposition_pending: false,
            settle_sent: false,
            in_work: false,
            in_tpwork: false,
        }
    }

    /// Id of the delivery
    pub fn id(&self) -> DeliveryId {
        self.id
    }

    /// The link that carries the delivery
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Tag of the delivery, unique among the unsettled deliveries of its link
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    /// Local disposition
    pub fn local_state(&self) -> Option<&DeliveryState> {
        self.local.as_ref()
    }

    /// Disposition last received from the peer
    pub fn remote_state(&self) -> Option<&DeliveryState> {
        self.remote.as_ref()
    }

    /// Whether the delivery has been settled locally
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Whether the peer has settled the delivery
    pub fn remote_settled(&self) -> bool {
        self.remote_settled
    }

    /// Whether the delivery changed since [`Connection::clear`] was last called on it
    pub fn updated(&self) -> bool {
        self.updated
    }

    /// Number of received bytes not yet read, or sent bytes not yet framed
    pub fn pending(&self) -> usize {
        self.data.len()
    }

    /// Whether more transfer frames are expected for this incoming delivery
    pub fn partial(&self) -> bool {
        self.partial
    }

    /// Whether the sender aborted the delivery
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Whether an outgoing delivery still has data waiting to be written
    pub fn is_buffered(&self) -> bool {
        self.is_outgoing() && !self.transfer_complete && (!self.data.is_empty() || self.advanced)
    }

    pub(crate) fn is_outgoing(&self) -> bool {
        matches!(self.role, Role::Sender)
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{tag={}, local={:?}, remote={:?}, settled={}, remote_settled={}, updated={}, pending={}, partial={}}}",
            String::from_utf8_lossy(&self.tag),
            self.local,
            self.remote,
            self.settled,
            self.remote_settled,
            self.updated,
            self.data.len(),
            self.partial,
        )
    }
}

impl Connection {
    /// Looks up a delivery
    pub fn get_delivery(&self, delivery: DeliveryId) -> Option<&Delivery> {
        self.deliveries.get(&delivery)
    }

    /// Sets the local disposition. It goes out with the next frame for the delivery.
    pub fn update(&mut self, delivery: DeliveryId, state: DeliveryState) -> Result<(), Error> {
        let d = self.deliveries.get_mut(&delivery).ok_or(Error::NotFound)?;
        if d.settled {
            return Err(Error::IllegalState("delivery is already settled"));
        }
        d.local = Some(state);
        d.disposition_pending = true;
        self.mark_updated(delivery);
        self.add_tpwork(delivery);
        Ok(())
    }

    /// Settles the delivery locally. A settled delivery cannot be updated or settled again.
    pub fn settle(&mut self, delivery: DeliveryId) -> Result<(), Error> {
        let d = self.deliveries.get_mut(&delivery).ok_or(Error::NotFound)?;
        if d.settled {
            return Err(Error::IllegalState("delivery is already settled"));
        }
        d.settled = true;
        if d.number.is_some() && !d.remote_settled {
            d.disposition_pending = true;
        }
        let link = d.link;

        #[cfg(feature = "tracing")]
        tracing::debug!(?delivery, "settle");
        #[cfg(feature = "log")]
        log::debug!("settle delivery={:?}", delivery);

        if self.links.get(link.0).and_then(|l| l.current) == Some(delivery) {
            self.advance(link)?;
        }
        self.add_tpwork(delivery);
        Ok(())
    }

    /// Clears the `updated` flag and removes the delivery from the work list
    pub fn clear(&mut self, delivery: DeliveryId) {
        if let Some(d) = self.deliveries.get_mut(&delivery) {
            d.updated = false;
            d.in_work = false;
        }
        self.work_list.retain(|id| *id != delivery);
    }

    /// Whether the delivery is the current one on a receiving link
    pub fn readable(&self, delivery: DeliveryId) -> bool {
        self.deliveries
            .get(&delivery)
            .and_then(|d| self.links.get(d.link.0))
            .map(|l| l.is_receiver() && l.current == Some(delivery))
            .unwrap_or(false)
    }

    /// Whether the delivery is the current one on a sending link and may be sent
    pub fn writable(&self, delivery: DeliveryId) -> bool {
        match self.deliveries.get(&delivery) {
            Some(d) => self
                .links
                .get(d.link.0)
                .map(|l| {
                    l.is_sender()
                        && l.current == Some(delivery)
                        && (l.credit > 0 || d.issued)
                })
                .unwrap_or(false),
            None => false,
        }
    }

    /// First delivery in the work list
    pub fn work_head(&self) -> Option<DeliveryId> {
        self.work_list
            .iter()
            .copied()
            .find(|id| self.deliveries.get(id).map(|d| d.updated).unwrap_or(false))
    }

    /// Delivery following `delivery` in the work list
    pub fn work_next(&self, delivery: DeliveryId) -> Option<DeliveryId> {
        self.work_list
            .iter()
            .copied()
            .skip_while(|id| *id != delivery)
            .skip(1)
            .find(|id| self.deliveries.get(id).map(|d| d.updated).unwrap_or(false))
    }

    pub(crate) fn mark_updated(&mut self, delivery: DeliveryId) {
        if let Some(d) = self.deliveries.get_mut(&delivery) {
            d.updated = true;
            if !d.in_work {
                d.in_work = true;
                self.work_list.push_back(delivery);
            }
        }
    }

    pub(crate) fn add_tpwork(&mut self, delivery: DeliveryId) {
        if let Some(d) = self.deliveries.get_mut(&delivery) {
            if !d.in_tpwork {
                d.in_tpwork = true;
                self.tpwork.push_back(delivery);
            }
        }
    }

    pub(crate) fn emit_delivery(&self, delivery: DeliveryId) {
        let ids = self
            .deliveries
            .get(&delivery)
            .and_then(|d| self.links.get(d.link.0).map(|l| (l.session, d.link)));
        if let Some((session, link)) = ids {
            self.emit(Event::delivery(self.id, session, link, delivery));
        }
    }

    /// Whether nothing references the delivery any more
    pub(crate) fn is_delivery_reclaimable(&self, d: &Delivery) -> bool {
        if !d.settled || d.in_tpwork {
            return false;
        }
        let peer_done = d.settle_sent || d.remote_settled || d.number.is_none();
        let transfer_done = !d.is_outgoing() || d.transfer_complete || !d.issued;
        peer_done && transfer_done
    }
}
