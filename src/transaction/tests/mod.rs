use super::endpoint::{Endpoint, EndpointBuilder};
use crate::{
    transport::{udp::UdpConnection, TransportLayer},
    Result,
};
use tokio_util::sync::CancellationToken;

mod test_client;
mod test_server;

pub(super) async fn create_test_endpoint(addr: Option<&str>) -> Result<Endpoint> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());

    if let Some(addr) = addr {
        let socket = UdpConnection::create_connection(addr.parse()?, None).await?;
        transport_layer.add_transport(socket.into());
    }

    let endpoint = EndpointBuilder::new()
        .with_user_agent("siprelay-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(token)
        .build();
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use crate::{
        rsip_ext::extract_uri_from_contact,
        transaction::{make_tag, make_via_branch, random_text},
    };

    #[test]
    fn test_random_text() {
        let text = random_text(10);
        assert_eq!(text.len(), 10);
        let branch = make_via_branch().to_string();
        assert_eq!(branch.len(), 27); // ;branch=z9hG4bK + 12 random chars
        assert_ne!(make_tag(), make_tag());
    }

    #[test]
    fn test_loose_contact() {
        let line = "<sip:bob@localhost;transport=udp>;expires=3600;+org.linphone.specs=\"lime\"";
        let contact_uri = extract_uri_from_contact(line).expect("failed to parse contact");
        assert_eq!(contact_uri.to_string(), "sip:bob@localhost;transport=UDP");

        let line = "<sip:bob@example.com;transport=udp>;message-expires=2419200;+sip.instance=\"<urn:uuid:12345-81fa-4fe3-aa6c-17bffdbcf619>\"";
        let contact_uri = extract_uri_from_contact(line).expect("failed to parse contact");
        assert_eq!(contact_uri.to_string(), "sip:bob@example.com;transport=UDP");
    }
}
