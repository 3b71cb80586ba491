use crate::transport::Transport;

/// Something an I/O multiplexer can wait on
pub trait Selectable {
    /// Whether bytes may be read into it
    fn is_readable(&self) -> bool;

    /// Whether it has bytes waiting to be written
    fn is_writable(&self) -> bool;

    /// Whether nothing more can be read or written
    fn is_closed(&self) -> bool;

    /// OS handle backing it, if any
    fn handle(&self) -> Option<usize>;
}

impl Selectable for Transport {
    fn is_readable(&self) -> bool {
        !self.tail_closed
    }

    fn is_writable(&self) -> bool {
        !self.head_closed && !self.output.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.head_closed && self.tail_closed
    }

    fn handle(&self) -> Option<usize> {
        None
    }
}
