use anyhow::{
    Error,
    Result,
};

use crate::{
    message::message::Message,
    serializer::serializer::{
        Serializer,
        SerializerType,
    },
};

/// A serializer implemented for MessagePack.
#[derive(Debug, Default)]
pub struct MessagePackSerializer {}

impl Serializer for MessagePackSerializer {
    fn protocol_id(&self) -> &str {
        SerializerType::MessagePack.protocol_id()
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(Error::new)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        rmp_serde::from_slice(bytes).map_err(Error::new)
    }
}

#[cfg(test)]
mod message_pack_test {
    use crate::{
        core::{
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::message::{
            CallMessage,
            EventMessage,
            Message,
            ResultMessage,
        },
        serializer::{
            message_pack::MessagePackSerializer,
            serializer::Serializer,
        },
    };

    #[test]
    fn serializes_call_as_binary() {
        let serializer = MessagePackSerializer::default();
        assert!(serializer.is_binary());
        assert_eq!(serializer.protocol_id(), "wamp.2.msgpack");

        let message = Message::Call(CallMessage {
            request: Id::try_from(7814135).unwrap(),
            options: Dictionary::from_iter([("receive_progress".to_owned(), Value::Bool(true))]),
            procedure: Uri::try_from("com.myapp.echo").unwrap(),
            arguments: List::from_iter([Value::Integer(1), Value::String("two".to_owned())]),
            arguments_keyword: Dictionary::from_iter([(
                "three".to_owned(),
                Value::List(List::from_iter([Value::Bool(false)])),
            )]),
        });
        let bytes = serializer.serialize(&message).unwrap();
        assert_eq!(bytes[0] & 0xf0, 0x90);
        pretty_assertions::assert_eq!(serializer.deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn decodes_negative_float_and_null_arguments() {
        let serializer = MessagePackSerializer::default();
        let bytes =
            rmp_serde::to_vec(&serde_json::json!([36, 10, 100, {}, [-1, 1.5, null]])).unwrap();
        let message = serializer.deserialize(&bytes).unwrap();
        pretty_assertions::assert_eq!(
            message,
            Message::Event(EventMessage {
                subscribed_subscription: Id::try_from(10).unwrap(),
                published_publication: Id::try_from(100).unwrap(),
                details: Dictionary::default(),
                arguments: List::from_iter([
                    Value::SignedInteger(-1),
                    Value::Float(1.5),
                    Value::Null,
                ]),
                arguments_keyword: Dictionary::default(),
            })
        );
        let bytes = serializer.serialize(&message).unwrap();
        pretty_assertions::assert_eq!(serializer.deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn decodes_float_in_keyword_arguments() {
        let serializer = MessagePackSerializer::default();
        let bytes =
            rmp_serde::to_vec(&serde_json::json!([50, 7, {}, [], {"price": 9.99}])).unwrap();
        let message = serializer.deserialize(&bytes).unwrap();
        assert_matches::assert_matches!(&message, Message::Result(ResultMessage { arguments_keyword, .. }) => {
            assert_eq!(arguments_keyword.get("price"), Some(&Value::Float(9.99)));
        });
        let bytes = serializer.serialize(&message).unwrap();
        pretty_assertions::assert_eq!(serializer.deserialize(&bytes).unwrap(), message);
    }
}
