use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, RecordType};
use rand::Rng;

use crate::config::{Benchmark, DEFAULT_EDNS0_BUFFER_SIZE};

/// Build the DNS query message for one benchmark iteration.
///
/// The transaction id comes from the worker's PRNG, except for DoQ where
/// RFC 9250 requires it to be 0. EDNS shaping is applied in the order
/// buffer size, local option, DO bit, creating an OPT record with the
/// default buffer size whenever a later step needs one.
pub fn build_query<R: Rng>(b: &Benchmark, name: &Name, qtype: RecordType, rng: &mut R) -> Message {
	let mut msg = Message::new();
	msg.set_recursion_desired(b.recurse);
	msg.add_query(Query::query(name.clone(), qtype));

	if b.use_quic {
		msg.set_id(0);
	} else {
		msg.set_id(rng.gen::<u16>());
	}

	if b.edns0 > 0 {
		let mut edns = Edns::new();
		edns.set_max_payload(b.edns0);
		edns.set_version(0);
		msg.set_edns(edns);
	}
	if let Some((code, data)) = &b.edns_opt_parsed {
		let mut edns = take_or_default_edns(&mut msg);
		edns.options_mut()
			.insert(EdnsOption::Unknown(*code, data.clone()));
		msg.set_edns(edns);
	}
	if b.dnssec {
		let mut edns = take_or_default_edns(&mut msg);
		edns.set_dnssec_ok(true);
		msg.set_edns(edns);
	}

	msg
}

/// Existing OPT record of the message, or a fresh one with the default
/// EDNS0 buffer size.
fn take_or_default_edns(msg: &mut Message) -> Edns {
	match msg.edns() {
		Some(edns) => edns.clone(),
		None => {
			let mut edns = Edns::new();
			edns.set_max_payload(DEFAULT_EDNS0_BUFFER_SIZE);
			edns.set_version(0);
			edns
		}
	}
}
