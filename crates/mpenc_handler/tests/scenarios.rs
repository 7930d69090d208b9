//! End-to-end scenarios driving several `ProtocolHandler`s against one
//! another through an in-memory wire.

use std::collections::HashMap;

use mpenc_handler::{HandlerConfig, HandlerState, ProtocolHandler};
use mpenc_proto::codec::{self, WireFrame};
use mpenc_proto::error_frame::{ErrorFrame, Severity};

/// A fully-connected in-memory network: every handler's outbound protocol
/// frames are classified and routed to their declared destination (or
/// broadcast to the rest of the member list).
struct Network {
    handlers: HashMap<String, ProtocolHandler>,
}

impl Network {
    fn new(ids: &[&str]) -> Self {
        let mut handlers = HashMap::new();
        for id in ids {
            handlers.insert(id.to_string(), ProtocolHandler::new(*id, HandlerConfig::default()));
        }
        Self { handlers }
    }

    fn get(&self, id: &str) -> &ProtocolHandler {
        self.handlers.get(id).unwrap_or_else(|| panic!("no handler named {id}"))
    }

    fn get_mut(&mut self, id: &str) -> &mut ProtocolHandler {
        self.handlers.get_mut(id).unwrap_or_else(|| panic!("no handler named {id}"))
    }

    /// Repeatedly drain every handler's protocol queue and deliver each
    /// frame to its recipients, until a full pass produces nothing new.
    fn settle(&mut self) {
        loop {
            let mut delivered_any = false;
            let ids: Vec<String> = self.handlers.keys().cloned().collect();
            for id in &ids {
                let frames: Vec<String> = self.get_mut(id).protocol_out_queue.drain(..).collect();
                for frame in frames {
                    delivered_any = true;
                    for target in recipients(&frame, id) {
                        if let Some(h) = self.handlers.get_mut(&target) {
                            let _ = h.process_message(&frame, id);
                        }
                    }
                }
            }
            if !delivered_any {
                break;
            }
        }
    }

    /// Deliver a single wire frame from `from` to `to` without settling the
    /// rest of the network (used to control ordering precisely).
    fn deliver_directly(&mut self, to: &str, from: &str, frame: &str) {
        if let Some(h) = self.handlers.get_mut(to) {
            let _ = h.process_message(frame, from);
        }
    }
}

fn recipients(frame: &str, from: &str) -> Vec<String> {
    match codec::classify(frame) {
        WireFrame::Greet(msg) => {
            if !msg.dest.is_empty() {
                vec![msg.dest]
            } else {
                msg.members.into_iter().filter(|m| m != from).collect()
            }
        }
        WireFrame::Error(_) | WireFrame::Query(_) => vec![],
        _ => vec![],
    }
}

#[test]
fn three_party_agreement() {
    let mut net = Network::new(&["1", "2", "3"]);
    net.get_mut("1").start(vec!["2".into(), "3".into()]).unwrap();
    net.settle();

    for id in ["1", "2", "3"] {
        assert_eq!(net.get(id).state(), HandlerState::Ready, "{id} did not reach READY");
    }
    let sid1 = net.get("1").session_id().unwrap().to_string();
    assert_eq!(net.get("2").session_id().unwrap(), sid1);
    assert_eq!(net.get("3").session_id().unwrap(), sid1);

    let key1 = net.get("1").current_group_key().unwrap();
    assert_eq!(net.get("2").current_group_key().unwrap(), key1);
    assert_eq!(net.get("3").current_group_key().unwrap(), key1);
}

#[test]
fn join_then_exclude_then_refresh_then_recover() {
    let mut net = Network::new(&["1", "2", "3", "4", "5"]);
    net.get_mut("1").start(vec!["2".into(), "3".into()]).unwrap();
    net.settle();
    for id in ["1", "2", "3"] {
        assert_eq!(net.get(id).state(), HandlerState::Ready);
    }

    net.get_mut("2").join(vec!["4".into(), "5".into()]).unwrap();
    net.settle();
    for id in ["1", "2", "3", "4", "5"] {
        assert_eq!(net.get(id).state(), HandlerState::Ready, "{id} did not rejoin READY after join()");
    }
    let joined_sid = net.get("2").session_id().unwrap().to_string();

    net.get_mut("2").exclude(vec!["1".into(), "3".into()]).unwrap();
    net.settle();
    for id in ["2", "4", "5"] {
        assert_eq!(net.get(id).state(), HandlerState::Ready, "{id} did not reach READY after exclude()");
        let members = net.get(id).members().to_vec();
        let mut expected = vec!["2".to_string(), "4".to_string(), "5".to_string()];
        let mut actual = members;
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
    }
    let excluded_sid = net.get("2").session_id().unwrap().to_string();
    assert_ne!(excluded_sid, joined_sid);

    let pre_refresh_key = net.get("2").current_group_key().unwrap();
    net.get_mut("2").refresh().unwrap();
    net.settle();
    for id in ["2", "4", "5"] {
        assert_eq!(net.get(id).state(), HandlerState::Ready, "{id} did not reach READY after refresh()");
    }
    let post_refresh_key = net.get("2").current_group_key().unwrap();
    assert_ne!(pre_refresh_key, post_refresh_key);
    assert_eq!(net.get("4").current_group_key().unwrap(), post_refresh_key);
    assert_eq!(net.get("5").current_group_key().unwrap(), post_refresh_key);

    // force member 5 into AUX_UPFLOW by having it initiate a join that
    // never completes, then have it recover.
    net.get_mut("5").join(vec!["6".into()]).unwrap();
    assert_eq!(net.get("5").state(), HandlerState::AuxUpflow);
    net.get_mut("5").protocol_out_queue.clear();

    net.get_mut("5").recover(None).unwrap();
    assert!(net.get("5").recovering());
    net.settle();

    assert_eq!(net.get("5").state(), HandlerState::Ready);
    assert!(!net.get("5").recovering());
}

#[test]
fn last_man_standing_triggers_quit() {
    let mut net = Network::new(&["a", "b"]);
    net.get_mut("a").start(vec!["b".into()]).unwrap();
    net.settle();
    assert_eq!(net.get("a").state(), HandlerState::Ready);
    assert_eq!(net.get("b").state(), HandlerState::Ready);

    net.get_mut("a").exclude(vec!["b".into()]).unwrap();
    assert_eq!(net.get("a").state(), HandlerState::Quit);
}

#[test]
fn plaintext_bootstrap_triggers_query_then_start() {
    let mut net = Network::new(&["a", "b"]);

    net.get_mut("b").process_message("hello there", "").unwrap();
    assert_eq!(net.get("b").ui_queue.len(), 1);
    let query_frame = net.get_mut("b").protocol_out_queue.pop_front().unwrap();
    assert!(query_frame.starts_with("?mpENCv"));

    net.get_mut("a").process_message(&query_frame, "b").unwrap();
    assert_eq!(net.get("a").state(), HandlerState::InitUpflow);
}

#[test]
fn delayed_data_message_is_stashed_and_resolved_on_ready() {
    let mut net = Network::new(&["a", "b"]);
    net.get_mut("a").start(vec!["b".into()]).unwrap();

    // deliver only the first upflow hop; b never gets to broadcast its
    // downflow, so neither party reaches READY yet.
    let upflow = net.get_mut("a").protocol_out_queue.pop_front().unwrap();
    net.deliver_directly("b", "a", &upflow);
    assert_ne!(net.get("b").state(), HandlerState::Ready);

    // a tries to send before it is READY: precondition violation.
    assert!(net.get_mut("a").send("too early", vec![]).is_err());

    // manufacture an encrypted-looking data frame addressed at b and feed
    // it in while b is not yet READY; b must reject at the precondition
    // boundary rather than silently drop it.
    let bogus_data_frame = {
        let payload = codec::ProtocolPayload::Data(mpenc_proto::data::DataEnvelope {
            session_hint: 0,
            version: mpenc_proto::data::PROTOCOL_VERSION,
            source: "a".into(),
            dest: String::new(),
            signature: vec![0u8; 64],
            iv: [0u8; 24],
            ciphertext: vec![1, 2, 3],
        });
        codec::encode_protocol_frame(mpenc_proto::data::PROTOCOL_VERSION, &payload).unwrap()
    };
    assert!(net.get_mut("b").process_message(&bogus_data_frame, "a").is_err());
}

#[test]
fn terminal_error_from_peer_forces_local_quit() {
    let mut net = Network::new(&["a", "b"]);
    net.get_mut("a").start(vec!["b".into()]).unwrap();
    net.settle();
    assert_eq!(net.get("a").state(), HandlerState::Ready);
    assert_eq!(net.get("b").state(), HandlerState::Ready);

    net.get_mut("b").send_error(Severity::Terminal, "session authentication by member a failed").unwrap();
    let error_frame = net
        .get_mut("b")
        .protocol_out_queue
        .iter()
        .find(|f| f.starts_with("?mpENC Error:"))
        .cloned()
        .unwrap();
    assert!(ErrorFrame::from_wire(&error_frame).is_some());

    net.get_mut("a").process_message(&error_frame, "b").unwrap();
    assert_eq!(net.get("a").state(), HandlerState::Quit);
    assert!(net.get("a").ui_queue.iter().any(|e| matches!(e, mpenc_handler::UiEvent::Terminal(_))));
}

#[test]
fn forged_frame_signature_is_caught_and_forces_local_quit() {
    let mut net = Network::new(&["a", "b"]);
    net.get_mut("a").start(vec!["b".into()]).unwrap();
    let upflow = net.get_mut("a").protocol_out_queue.pop_front().unwrap();

    let mut msg = match codec::classify(&upflow) {
        WireFrame::Greet(m) => m,
        other => panic!("expected a greet frame, got {other:?}"),
    };
    msg.frame_signature.as_mut().expect("upflow messages are signed")[0] ^= 0xFF;
    let forged = codec::encode_protocol_frame(mpenc_proto::data::PROTOCOL_VERSION, &codec::ProtocolPayload::Greet(msg)).unwrap();

    net.get_mut("b").process_message(&forged, "a").unwrap();
    assert_eq!(net.get("b").state(), HandlerState::Quit);
    assert!(net.get("b").ui_queue.iter().any(|e| matches!(e, mpenc_handler::UiEvent::Terminal(_))));
}
