use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;

/// Element namespace used by the reliability protocol itself.
pub const NAMESPACE: &str = "rel";

/// Name of elements carrying acknowledgements.
pub const ACK_ELEMENT_NAME: &str = "ack";

/// Name and payload of the marker element tagging a chunk as a retransmission.
pub const RETRY_ELEMENT_NAME: &str = "retry";
pub const RETRY_ELEMENT_VALUE: &[u8] = b"retry";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageElement {
    pub namespace: String,
    pub name: String,
    pub payload: Bytes,
}

/// A message envelope: an ordered collection of named elements.
///
/// The envelope's actual wire format is owned by the surrounding endpoint code - the
///  reliability layer only adds, replaces and reads named elements and treats the rest
///  of the container as opaque. Cloning is cheap because element payloads are `Bytes`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Message {
    elements: Vec<MessageElement>,
}

impl Message {
    pub fn new() -> Message {
        Message { elements: Vec::new() }
    }

    pub fn add_element(&mut self, namespace: &str, name: &str, payload: Bytes) {
        self.elements.push(MessageElement {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            payload,
        });
    }

    /// Replaces the payload of the first element with the given namespace and name,
    ///  adding a new element if there is none.
    pub fn replace_element(&mut self, namespace: &str, name: &str, payload: Bytes) {
        match self.elements.iter_mut().find(|e| e.namespace == namespace && e.name == name) {
            Some(element) => element.payload = payload,
            None => self.add_element(namespace, name, payload),
        }
    }

    pub fn elements<'a>(&'a self, namespace: &'a str, name: &'a str) -> impl Iterator<Item = &'a MessageElement> {
        self.elements.iter()
            .filter(move |e| e.namespace == namespace && e.name == name)
    }

    /// Total content bytes across all elements, namespaces and names included.
    pub fn byte_len(&self) -> usize {
        self.elements.iter()
            .map(|e| e.namespace.len() + e.name.len() + e.payload.len())
            .sum()
    }

    /// Serializes the envelope so it can travel as the payload of a single chunk. This
    ///  is used by the raw send path which must preserve ordering with the data stream.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.elements.len());
        for element in &self.elements {
            buf.put_usize_varint(element.namespace.len());
            buf.put_slice(element.namespace.as_bytes());
            buf.put_usize_varint(element.name.len());
            buf.put_slice(element.name.as_bytes());
            buf.put_usize_varint(element.payload.len());
            buf.put_slice(&element.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_replace_element() {
        let mut msg = Message::new();
        msg.add_element(NAMESPACE, "1", Bytes::from_static(b"abc"));

        msg.replace_element(NAMESPACE, RETRY_ELEMENT_NAME, Bytes::from_static(RETRY_ELEMENT_VALUE));
        assert_eq!(msg.elements(NAMESPACE, RETRY_ELEMENT_NAME).count(), 1);

        msg.replace_element(NAMESPACE, RETRY_ELEMENT_NAME, Bytes::from_static(b"x"));
        let retry = msg.elements(NAMESPACE, RETRY_ELEMENT_NAME).collect::<Vec<_>>();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].payload.as_ref(), b"x");

        assert_eq!(msg.elements(NAMESPACE, "1").count(), 1);
    }

    #[rstest]
    fn test_elements_filters_by_namespace_and_name() {
        let mut msg = Message::new();
        msg.add_element(NAMESPACE, ACK_ELEMENT_NAME, Bytes::from_static(b"a"));
        msg.add_element("other", ACK_ELEMENT_NAME, Bytes::from_static(b"b"));
        msg.add_element(NAMESPACE, ACK_ELEMENT_NAME, Bytes::from_static(b"c"));

        let acks = msg.elements(NAMESPACE, ACK_ELEMENT_NAME)
            .map(|e| e.payload.as_ref())
            .collect::<Vec<_>>();
        assert_eq!(acks, vec![b"a".as_ref(), b"c".as_ref()]);
    }

    #[rstest]
    fn test_ser() {
        let mut msg = Message::new();
        msg.add_element("ns", "el", Bytes::from_static(b"xyz"));

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);

        assert_eq!(buf.as_ref(), &[1, 2, b'n', b's', 2, b'e', b'l', 3, b'x', b'y', b'z']);
        assert_eq!(msg.byte_len(), 7);
    }
}
