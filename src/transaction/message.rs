use super::{endpoint::EndpointInner, make_call_id, make_via_branch};
use crate::{
    rsip_ext::RsipResponseExt,
    transport::SipAddr,
    Result,
};
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Request, Response, StatusCode,
};

impl EndpointInner {
    /// Build a request with the mandatory RFC 3261 section 8.1.1 headers:
    /// Via, Call-ID, From, To, CSeq, Max-Forwards and User-Agent.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> rsip::Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref())),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Build a response from a request, copying the headers section 8.2.6
    /// requires and dropping everything else.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Response {
            status_code,
            version: req.version().clone(),
            headers,
            body: body.unwrap_or_default(),
        }
    }

    /// Build the ACK for a 2xx INVITE response on the TU's behalf.
    ///
    /// The Request-URI comes from `uri` when given, else from the
    /// response's Contact (with the RFC 5626 `ob` rewrite against
    /// `destination`). The Route set is the reversed Record-Route set, and
    /// the top Via gets a fresh branch since a 2xx ACK is its own
    /// transaction.
    pub fn make_ack(
        &self,
        resp: &Response,
        uri: Option<rsip::Uri>,
        destination: Option<&SipAddr>,
    ) -> Result<Request> {
        let mut headers = resp.headers.clone();

        let to_invite = resp
            .cseq_header()
            .and_then(|cseq| cseq.method())
            .map(|m| m == rsip::Method::Invite)
            .unwrap_or(false);
        let successful = resp.status_code.kind() == rsip::StatusCodeKind::Successful;

        let mut req_uri = uri;
        if to_invite && successful {
            for header in headers.iter_mut() {
                if let Header::Via(via) = header {
                    if let Ok(mut typed_via) = via.typed() {
                        for param in typed_via.params.iter_mut() {
                            if let rsip::Param::Branch(_) = param {
                                *param = make_via_branch();
                            }
                        }
                        *via = typed_via.into();
                    }
                    break;
                }
            }

            if req_uri.is_none() {
                req_uri = Some(resp.remote_uri(destination)?);
            }

            let mut route_set = Vec::new();
            for header in resp.headers.iter() {
                if let Header::RecordRoute(record_route) = header {
                    route_set.push(Header::Route(Route::from(record_route.value())));
                }
            }
            route_set.reverse();
            headers.extend(route_set);
        }

        let req_uri = match req_uri {
            Some(uri) => uri,
            None => resp.remote_uri(destination)?,
        };

        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
                    | Header::Route(_)
            )
        });
        headers.push(Header::MaxForwards(70.into()));
        for header in headers.iter_mut() {
            if let Header::CSeq(cseq) = header {
                cseq.mut_method(rsip::Method::Ack).ok();
            }
        }
        headers.push(Header::ContentLength((0u32).into()));
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Ok(rsip::Request {
            method: rsip::Method::Ack,
            uri: req_uri,
            headers,
            body: vec![],
            version: rsip::Version::V2,
        })
    }
}
