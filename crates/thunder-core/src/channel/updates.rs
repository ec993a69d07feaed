//! HTLC updates, the `commitment_signed` / `revoke_and_ack` exchange, the
//! holding cell and reconnection.
//!
//! Outgoing update messages are never sent one by one. They accumulate in
//! the local log and go out as one [`CommitmentUpdate`] batch together
//! with the signature covering them, so a batch can always be rebuilt
//! from the log for retransmission.

use super::{BADONION, Channel, ChannelOutcome, signer_error};
use crate::chain::FeeEstimator;
use crate::chain::monitor::{
    ChannelMonitorUpdate, ChannelMonitorUpdateStep, HolderCommitmentTransaction, HolderHTLCOutput,
};
use crate::channel::htlc::{
    DroppedHTLC, HTLCFailReason, HTLCSource, LockedInHTLC, PendingHTLCStatus, ResolvedHTLC,
};
use crate::channel::state::{
    ChannelState, CommitmentView, FailPayload, HoldingCellUpdate, LogUpdate, RAACommitmentOrder,
};
use crate::commitment::{
    INITIAL_COMMITMENT_NUMBER, build_htlc_transaction, commitment_tx_fee_sat, get_htlc_redeemscript,
    p2wsh_sighash,
};
use crate::error::ChannelError;
use crate::events::CommitmentUpdate;
use crate::keys::SECP;
use crate::onion::TEMPORARY_CHANNEL_FAILURE;
use crate::msgs::{
    ChannelReestablish, CommitmentSigned, OnionPacket, RevokeAndACK, UpdateAddHTLC, UpdateFailHTLC,
    UpdateFailMalformedHTLC, UpdateFee, UpdateFulfillHTLC,
};
use crate::types::{PaymentHash, PaymentPreimage};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use tracing::{debug, trace, warn};

impl Channel {
    fn check_connected(&self, msg: &'static str) -> Result<(), ChannelError> {
        if !self.state.is_operational() {
            return Err(ChannelError::close(format!("got {msg} when channel was not in an operational state")));
        }
        if self.flags.peer_disconnected {
            return Err(ChannelError::close(format!("got {msg} while disconnected")));
        }
        Ok(())
    }

    fn can_generate_new_commitment(&self) -> bool {
        !self.flags.awaiting_remote_revoke && !self.flags.monitor_update_in_progress && !self.flags.peer_disconnected
    }

    fn is_committed_local_add(&self, log_index: u64) -> bool {
        log_index < self.holder_tip.ours.min(self.remote_tail.ours)
    }

    fn is_committed_remote_add(&self, log_index: u64) -> bool {
        log_index < self.holder_tip.theirs.min(self.remote_tail.theirs)
    }

    fn holding_cell_resolves(&self, htlc_id: u64) -> bool {
        self.holding_cell.iter().any(|update| match update {
            HoldingCellUpdate::ClaimHTLC { htlc_id: id, .. } | HoldingCellUpdate::FailHTLC { htlc_id: id, .. } => {
                *id == htlc_id
            }
            _ => false,
        })
    }

    // ============ Sending Updates ============

    fn validate_outbound_add(&self, amount_msat: u64) -> Result<(), ChannelError> {
        if amount_msat == 0 {
            return Err(ChannelError::ignore("cannot send 0-msat HTLC"));
        }
        if amount_msat < self.counterparty_htlc_minimum_msat {
            return Err(ChannelError::ignore("cannot send less than their minimum HTLC value"));
        }
        let stats = self.stats(self.latest_view())?;
        let (held_count, held_msat) = self.holding_cell.iter().fold((0usize, 0u64), |(count, sum), update| match update {
            HoldingCellUpdate::AddHTLC { amount_msat, .. } => (count + 1, sum + amount_msat),
            _ => (count, sum),
        });

        let outbound_count = stats.htlcs.iter().filter(|h| h.outbound).count() + held_count;
        if outbound_count + 1 > usize::from(self.counterparty_max_accepted_htlcs) {
            return Err(ChannelError::ignore("cannot push more than their max accepted HTLCs"));
        }
        let in_flight: u64 = stats
            .htlcs
            .iter()
            .filter(|h| h.outbound)
            .map(|h| h.amount_msat)
            .sum::<u64>()
            + held_msat;
        if in_flight + amount_msat > self.counterparty_max_htlc_value_in_flight_msat {
            return Err(ChannelError::ignore(
                "cannot send value that would put us over the max HTLC value in flight our peer will accept",
            ));
        }

        let fee_msat = if self.is_outbound {
            commitment_tx_fee_sat(stats.feerate_per_kw, stats.htlcs.len() + held_count + 1) * 1000
        } else {
            0
        };
        let needed = amount_msat + held_msat + fee_msat + self.counterparty_selected_channel_reserve_satoshis * 1000;
        if stats.local_msat < needed {
            return Err(ChannelError::ignore(
                "cannot send value that would put us under local channel reserve value",
            ));
        }
        Ok(())
    }

    fn push_local_add(
        &mut self,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        source: HTLCSource,
        onion: Box<OnionPacket>,
    ) {
        let htlc_id = self.next_holder_htlc_id;
        self.next_holder_htlc_id += 1;
        trace!(channel_id = %self.channel_id, htlc_id, amount_msat, "adding outbound HTLC");
        self.local_log.push(LogUpdate::Add {
            htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion: Some(onion),
            source: Some(source),
            pending: None,
        });
    }

    /// Offer an HTLC. It goes out with the next [`Channel::send_commitment`],
    /// or waits in the holding cell while a new commitment cannot be
    /// signed.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Ignore`] when the channel cannot carry the HTLC; the
    /// channel is unaffected.
    pub fn send_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        source: HTLCSource,
        onion: OnionPacket,
    ) -> Result<(), ChannelError> {
        if !self.is_usable() {
            return Err(ChannelError::ignore(
                "cannot send HTLC until channel is fully established and we haven't started shutting down",
            ));
        }
        if amount_msat > self.channel_value_satoshis * 1000 {
            return Err(ChannelError::ignore("cannot send more than the total value of the channel"));
        }
        self.validate_outbound_add(amount_msat)?;

        if !self.can_generate_new_commitment() {
            debug!(channel_id = %self.channel_id, amount_msat, "holding HTLC until the next commitment");
            self.holding_cell.push(HoldingCellUpdate::AddHTLC {
                amount_msat,
                payment_hash,
                cltv_expiry,
                source,
                onion: Box::new(onion),
            });
            return Ok(());
        }
        self.push_local_add(amount_msat, payment_hash, cltv_expiry, source, Box::new(onion));
        Ok(())
    }

    /// Claim a received HTLC. The returned monitor update carries the
    /// preimage and must be applied even if the claim itself is held.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Ignore`] for an unknown, mismatched or already
    /// resolved HTLC.
    pub fn get_update_fulfill_htlc(
        &mut self,
        htlc_id: u64,
        preimage: PaymentPreimage,
    ) -> Result<ChannelMonitorUpdate, ChannelError> {
        if !self.state.is_operational() {
            return Err(ChannelError::ignore("channel is not operational"));
        }
        let (log_index, payment_hash) = match self.remote_log.find_add(htlc_id) {
            Some(entry) => match &entry.update {
                LogUpdate::Add { payment_hash, .. } => (entry.log_index, *payment_hash),
                _ => return Err(ChannelError::ignore("unknown HTLC id")),
            },
            None => return Err(ChannelError::ignore("unknown HTLC id")),
        };
        if preimage.payment_hash() != payment_hash {
            return Err(ChannelError::ignore("preimage does not match the HTLC's payment hash"));
        }
        if !self.is_committed_remote_add(log_index) {
            return Err(ChannelError::ignore("HTLC is not yet committed"));
        }
        if self.local_log.find_removal(htlc_id).is_some() || self.holding_cell_resolves(htlc_id) {
            return Err(ChannelError::ignore("HTLC was already resolved"));
        }

        let update = self.new_monitor_update(vec![ChannelMonitorUpdateStep::PaymentPreimage {
            payment_preimage: preimage,
        }]);
        if self.can_generate_new_commitment() {
            self.local_log.push(LogUpdate::Fulfill { htlc_id, preimage });
        } else {
            self.holding_cell.push(HoldingCellUpdate::ClaimHTLC { htlc_id, preimage });
        }
        debug!(channel_id = %self.channel_id, htlc_id, %payment_hash, "claiming HTLC");
        Ok(update)
    }

    /// Fail a received HTLC back
    ///
    /// # Errors
    ///
    /// [`ChannelError::Ignore`] for an unknown or already resolved HTLC.
    pub fn get_update_fail_htlc(&mut self, htlc_id: u64, payload: FailPayload) -> Result<(), ChannelError> {
        if !self.state.is_operational() {
            return Err(ChannelError::ignore("channel is not operational"));
        }
        let entry = self
            .remote_log
            .find_add(htlc_id)
            .ok_or_else(|| ChannelError::ignore("unknown HTLC id"))?;
        if !self.is_committed_remote_add(entry.log_index) {
            return Err(ChannelError::ignore("HTLC is not yet committed"));
        }
        if self.local_log.find_removal(htlc_id).is_some() || self.holding_cell_resolves(htlc_id) {
            return Err(ChannelError::ignore("HTLC was already resolved"));
        }
        if self.can_generate_new_commitment() {
            self.local_log.push(LogUpdate::Fail {
                htlc_id,
                payload: Some(payload),
                reason: None,
            });
        } else {
            self.holding_cell.push(HoldingCellUpdate::FailHTLC { htlc_id, payload });
        }
        debug!(channel_id = %self.channel_id, htlc_id, "failing HTLC back");
        Ok(())
    }

    /// Propose a new commitment fee rate. Only the opener may.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Ignore`] on the acceptor side or an unusable channel.
    pub fn send_update_fee(&mut self, feerate_per_kw: u32) -> Result<(), ChannelError> {
        if !self.is_outbound {
            return Err(ChannelError::ignore("only the channel opener may update the fee"));
        }
        if !self.is_usable() {
            return Err(ChannelError::ignore("cannot update fee on an unusable channel"));
        }
        if !self.can_generate_new_commitment() {
            self.holding_cell
                .retain(|update| !matches!(update, HoldingCellUpdate::UpdateFee { .. }));
            self.holding_cell.push(HoldingCellUpdate::UpdateFee { feerate_per_kw });
            return Ok(());
        }
        self.push_local_fee(feerate_per_kw);
        Ok(())
    }

    /// At most one fee change rides in each batch
    fn push_local_fee(&mut self, feerate_per_kw: u32) {
        let unsent = self.remote_tip.ours;
        let pending = self
            .local_log
            .iter_mut()
            .find(|e| e.log_index >= unsent && matches!(e.update, LogUpdate::Fee { .. }));
        match pending {
            Some(entry) => entry.update = LogUpdate::Fee { feerate_per_kw },
            None => self.local_log.push(LogUpdate::Fee { feerate_per_kw }),
        }
    }

    // ============ Receiving Updates ============

    /// Handle `update_add_htlc`. `pending_status` is the manager's decision
    /// from the onion, handed back once the HTLC is locked in.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the HTLC breaks our limits.
    pub fn update_add_htlc(&mut self, msg: &UpdateAddHTLC, pending_status: PendingHTLCStatus) -> Result<(), ChannelError> {
        self.check_connected("update_add_htlc")?;
        if self.flags.remote_shutdown_sent {
            return Err(ChannelError::close("got add HTLC message when channel was shutting down"));
        }
        if msg.amount_msat > self.channel_value_satoshis * 1000 {
            return Err(ChannelError::close("remote side tried to send more than the total value of the channel"));
        }
        if msg.amount_msat == 0 {
            return Err(ChannelError::close("remote side tried to send a 0-msat HTLC"));
        }
        if msg.amount_msat < self.holder_htlc_minimum_msat {
            return Err(ChannelError::close("remote side tried to send less than our minimum HTLC value"));
        }
        if msg.htlc_id != self.next_counterparty_htlc_id {
            return Err(ChannelError::close("remote skipped HTLC ID"));
        }
        if msg.cltv_expiry >= 500_000_000 {
            return Err(ChannelError::close("remote provided CLTV expiry in seconds instead of block height"));
        }

        let stats = self.stats(self.latest_view())?;
        let inbound_count = stats.htlcs.iter().filter(|h| !h.outbound).count();
        if inbound_count + 1 > usize::from(self.holder_max_accepted_htlcs) {
            return Err(ChannelError::close("remote tried to push more than our max accepted HTLCs"));
        }
        let in_flight: u64 = stats
            .htlcs
            .iter()
            .filter(|h| !h.outbound)
            .map(|h| h.amount_msat)
            .sum();
        if in_flight + msg.amount_msat > self.holder_max_htlc_value_in_flight_msat {
            return Err(ChannelError::close("remote HTLC add would put them over our max HTLC value in flight"));
        }
        let fee_msat = if self.is_outbound {
            0
        } else {
            commitment_tx_fee_sat(stats.feerate_per_kw, stats.htlcs.len() + 1) * 1000
        };
        if stats.remote_msat < msg.amount_msat + fee_msat + self.holder_selected_channel_reserve_satoshis * 1000 {
            return Err(ChannelError::close("remote HTLC add would put them under their reserve value"));
        }

        self.next_counterparty_htlc_id += 1;
        self.remote_log.push(LogUpdate::Add {
            htlc_id: msg.htlc_id,
            amount_msat: msg.amount_msat,
            payment_hash: msg.payment_hash,
            cltv_expiry: msg.cltv_expiry,
            onion: None,
            source: None,
            pending: Some(pending_status),
        });
        trace!(channel_id = %self.channel_id, htlc_id = msg.htlc_id, amount_msat = msg.amount_msat, "received HTLC");
        Ok(())
    }

    fn check_outbound_removable(&self, htlc_id: u64) -> Result<(HTLCSource, PaymentHash), ChannelError> {
        let entry = self
            .local_log
            .find_add(htlc_id)
            .ok_or_else(|| ChannelError::close("remote tried to resolve an HTLC that doesn't exist"))?;
        if !self.is_committed_local_add(entry.log_index) {
            return Err(ChannelError::close("remote tried to resolve an HTLC before it had been committed"));
        }
        if self.remote_log.find_removal(htlc_id).is_some() {
            return Err(ChannelError::close("remote tried to resolve an HTLC twice"));
        }
        match &entry.update {
            LogUpdate::Add {
                source: Some(source),
                payment_hash,
                ..
            } => Ok((source.clone(), *payment_hash)),
            _ => Err(ChannelError::close("resolved HTLC has no source")),
        }
    }

    /// Handle `update_fulfill_htlc`. The preimage is returned right away so
    /// it can be claimed upstream before the removal is committed.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] for an unknown HTLC or a wrong preimage.
    pub fn update_fulfill_htlc(&mut self, msg: &UpdateFulfillHTLC) -> Result<ResolvedHTLC, ChannelError> {
        self.check_connected("update_fulfill_htlc")?;
        let (source, payment_hash) = self.check_outbound_removable(msg.htlc_id)?;
        if msg.payment_preimage.payment_hash() != payment_hash {
            return Err(ChannelError::close("remote tried to fulfill HTLC with an incorrect preimage"));
        }
        self.remote_log.push(LogUpdate::Fulfill {
            htlc_id: msg.htlc_id,
            preimage: msg.payment_preimage,
        });
        debug!(channel_id = %self.channel_id, htlc_id = msg.htlc_id, %payment_hash, "HTLC fulfilled by peer");
        Ok(ResolvedHTLC::Fulfilled {
            source,
            preimage: msg.payment_preimage,
        })
    }

    fn push_remote_fail(&mut self, htlc_id: u64, reason: HTLCFailReason) -> Result<(), ChannelError> {
        self.check_outbound_removable(htlc_id)?;
        self.remote_log.push(LogUpdate::Fail {
            htlc_id,
            payload: None,
            reason: Some(reason),
        });
        debug!(channel_id = %self.channel_id, htlc_id, "HTLC failed by peer");
        Ok(())
    }

    /// Handle `update_fail_htlc`
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] for an unknown or uncommitted HTLC.
    pub fn update_fail_htlc(&mut self, msg: &UpdateFailHTLC) -> Result<(), ChannelError> {
        self.check_connected("update_fail_htlc")?;
        self.push_remote_fail(msg.htlc_id, HTLCFailReason::LightningError { err: msg.reason.clone() })
    }

    /// Handle `update_fail_malformed_htlc`
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if BADONION is not set or the HTLC is
    /// unknown.
    pub fn update_fail_malformed_htlc(&mut self, msg: &UpdateFailMalformedHTLC) -> Result<(), ChannelError> {
        self.check_connected("update_fail_malformed_htlc")?;
        if msg.failure_code & BADONION == 0 {
            return Err(ChannelError::close("got update_fail_malformed_htlc with BADONION not set"));
        }
        self.push_remote_fail(
            msg.htlc_id,
            HTLCFailReason::reason(msg.failure_code, msg.sha256_of_onion.to_vec()),
        )
    }

    /// Handle `update_fee`
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the acceptor sent it or the rate is
    /// unreasonable.
    pub fn update_fee(&mut self, fee_estimator: &dyn FeeEstimator, msg: &UpdateFee) -> Result<(), ChannelError> {
        if self.is_outbound {
            return Err(ChannelError::close("non-funding remote tried to update channel fee"));
        }
        self.check_connected("update_fee")?;
        Self::check_remote_fee(fee_estimator, msg.feerate_per_kw)?;
        self.remote_log.push(LogUpdate::Fee {
            feerate_per_kw: msg.feerate_per_kw,
        });
        Ok(())
    }

    // ============ Commitment Exchange ============

    fn build_commitment_update(&self, start: u64, end: u64, commitment_signed: CommitmentSigned) -> CommitmentUpdate {
        let channel_id = self.channel_id;
        let mut update = CommitmentUpdate {
            update_add_htlcs: Vec::new(),
            update_fulfill_htlcs: Vec::new(),
            update_fail_htlcs: Vec::new(),
            update_fail_malformed_htlcs: Vec::new(),
            update_fee: None,
            commitment_signed,
        };
        for entry in self.local_log.range(start, end) {
            match &entry.update {
                LogUpdate::Add {
                    htlc_id,
                    amount_msat,
                    payment_hash,
                    cltv_expiry,
                    onion: Some(onion),
                    ..
                } => update.update_add_htlcs.push(UpdateAddHTLC {
                    channel_id,
                    htlc_id: *htlc_id,
                    amount_msat: *amount_msat,
                    payment_hash: *payment_hash,
                    cltv_expiry: *cltv_expiry,
                    onion_routing_packet: (**onion).clone(),
                }),
                LogUpdate::Fulfill { htlc_id, preimage } => update.update_fulfill_htlcs.push(UpdateFulfillHTLC {
                    channel_id,
                    htlc_id: *htlc_id,
                    payment_preimage: *preimage,
                }),
                LogUpdate::Fail {
                    htlc_id,
                    payload: Some(FailPayload::Relay(reason)),
                    ..
                } => update.update_fail_htlcs.push(UpdateFailHTLC {
                    channel_id,
                    htlc_id: *htlc_id,
                    reason: reason.clone(),
                }),
                LogUpdate::Fail {
                    htlc_id,
                    payload: Some(FailPayload::Malformed {
                        sha256_of_onion,
                        failure_code,
                    }),
                    ..
                } => update.update_fail_malformed_htlcs.push(UpdateFailMalformedHTLC {
                    channel_id,
                    htlc_id: *htlc_id,
                    sha256_of_onion: *sha256_of_onion,
                    failure_code: *failure_code,
                }),
                LogUpdate::Fee { feerate_per_kw } => {
                    update.update_fee = Some(UpdateFee {
                        channel_id,
                        feerate_per_kw: *feerate_per_kw,
                    });
                }
                _ => {}
            }
        }
        update
    }

    /// Sign the counterparty's next commitment if it would differ from
    /// their latest, ignoring whether we are allowed to
    fn send_commitment_no_state_check(
        &mut self,
    ) -> Result<Option<(CommitmentUpdate, ChannelMonitorUpdateStep)>, ChannelError> {
        let view = CommitmentView {
            ours: self.local_log.next_index(),
            theirs: self.holder_tip.theirs,
        };
        if view == self.remote_tip {
            return Ok(None);
        }
        let point = self
            .counterparty_next_point
            .ok_or_else(|| ChannelError::close("counterparty next commitment point unknown"))?;
        let commitment_number = self.counterparty_tip_number + 1;
        let keys = self.counterparty_tx_keys(&point)?;
        let built = self.build_commitment(false, view, commitment_number, keys)?;
        let (signature, htlc_signatures) = self.sign_counterparty_commitment(&built)?;

        let htlc_outputs = built
            .htlcs
            .iter()
            .map(|(htlc, view_htlc)| (htlc.clone(), self.outbound_source(view_htlc)))
            .collect();
        let step = ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo {
            commitment_txid: built.commitment.tx.compute_txid(),
            commitment_number,
            per_commitment_point: point,
            feerate_per_kw: built.feerate_per_kw,
            htlc_outputs,
        };
        let update = self.build_commitment_update(
            self.remote_tip.ours,
            view.ours,
            CommitmentSigned {
                channel_id: self.channel_id,
                signature,
                htlc_signatures,
            },
        );

        self.remote_tip = view;
        self.counterparty_tip_number = commitment_number;
        self.flags.awaiting_remote_revoke = true;
        self.resend_order = RAACommitmentOrder::RevokeAndACKFirst;
        debug!(
            channel_id = %self.channel_id,
            commitment_number,
            htlcs = built.htlcs.len(),
            "signed counterparty commitment"
        );
        Ok(Some((update, step)))
    }

    /// Sign and batch everything pending for the counterparty. `None` when
    /// nothing changed or a commitment cannot be sent right now.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the commitment cannot be built or signed.
    pub fn send_commitment(&mut self) -> Result<Option<(CommitmentUpdate, ChannelMonitorUpdate)>, ChannelError> {
        if !self.state.is_operational() || !self.can_generate_new_commitment() {
            return Ok(None);
        }
        match self.send_commitment_no_state_check()? {
            Some((update, step)) => Ok(Some((update, self.new_monitor_update(vec![step])))),
            None => Ok(None),
        }
    }

    /// Handle `commitment_signed`: verify the new commitment, revoke the
    /// previous one, and sign back if we have changes of our own.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] on an empty commitment or any bad signature.
    pub fn commitment_signed(&mut self, msg: &CommitmentSigned) -> Result<ChannelOutcome, ChannelError> {
        self.check_connected("commitment_signed")?;
        let view = CommitmentView {
            ours: self.remote_tail.ours,
            theirs: self.remote_log.next_index(),
        };
        if view == self.holder_tip {
            return Err(ChannelError::close("peer sent commitment_signed with no updates"));
        }

        let commitment_number = self.holder_commitment_number + 1;
        let keys = self.holder_tx_keys(commitment_number)?;
        let built = self.build_commitment(true, view, commitment_number, keys)?;
        self.verify_funding_sig(&built.commitment.tx, &msg.signature)?;

        let untrimmed = built
            .htlcs
            .iter()
            .filter(|(htlc, _)| htlc.transaction_output_index.is_some())
            .count();
        if msg.htlc_signatures.len() != untrimmed {
            return Err(ChannelError::close(format!(
                "got wrong number of HTLC signatures ({}) from remote, expected {untrimmed}",
                msg.htlc_signatures.len()
            )));
        }

        let txid = built.commitment.tx.compute_txid();
        let mut sigs = msg.htlc_signatures.iter();
        let mut htlcs = Vec::with_capacity(built.htlcs.len());
        for (htlc, view_htlc) in &built.htlcs {
            let counterparty_sig = if htlc.transaction_output_index.is_some() {
                let sig = sigs
                    .next()
                    .ok_or_else(|| ChannelError::close("missing HTLC signature from peer"))?;
                let htlc_tx = build_htlc_transaction(
                    &txid,
                    built.feerate_per_kw,
                    self.counterparty_selected_contest_delay,
                    htlc,
                    &built.keys.broadcaster_delayed_payment_key,
                    &built.keys.revocation_key,
                );
                let script = get_htlc_redeemscript(htlc, &built.keys);
                let sighash = p2wsh_sighash(&htlc_tx, 0, &script, htlc.amount_msat / 1000).map_err(signer_error)?;
                SECP.verify_ecdsa(&sighash, sig, &built.keys.countersignatory_htlc_key)
                    .map_err(|_| ChannelError::close("invalid HTLC tx signature from peer"))?;
                Some(*sig)
            } else {
                None
            };
            htlcs.push(HolderHTLCOutput {
                htlc: htlc.clone(),
                counterparty_sig,
                source: self.outbound_source(view_htlc),
            });
        }

        let holder_commitment = HolderCommitmentTransaction {
            tx: built.commitment.tx,
            counterparty_sig: msg.signature,
            keys: built.keys,
            feerate_per_kw: built.feerate_per_kw,
            commitment_number,
            htlcs,
        };
        self.holder_tip = view;
        self.holder_commitment_number = commitment_number;
        let mut steps = vec![ChannelMonitorUpdateStep::LatestHolderCommitmentTxInfo {
            commitment: holder_commitment,
        }];
        let (locked_in, resolved) = self.process_lock_ins();
        self.resend_order = RAACommitmentOrder::CommitmentFirst;

        let mut outcome = ChannelOutcome::new(RAACommitmentOrder::RevokeAndACKFirst);
        outcome.resolved = resolved;
        if self.flags.monitor_update_in_progress {
            debug!(channel_id = %self.channel_id, "withholding revoke_and_ack until the monitor catches up");
            self.monitor_pending_revoke_and_ack = true;
            self.monitor_pending_locked_in.extend(locked_in);
            outcome.monitor_update = Some(self.new_monitor_update(steps));
            return Ok(outcome);
        }

        outcome.revoke_and_ack = Some(self.get_last_revoke_and_ack()?);
        outcome.locked_in = locked_in;
        if !self.flags.awaiting_remote_revoke {
            if let Some((update, step)) = self.send_commitment_no_state_check()? {
                steps.push(step);
                outcome.commitment_update = Some(update);
            }
        }
        outcome.monitor_update = Some(self.new_monitor_update(steps));
        debug!(channel_id = %self.channel_id, commitment_number, "accepted new holder commitment");
        Ok(outcome)
    }

    /// Handle `revoke_and_ack`: store the revealed secret, lock in what the
    /// revocation settled, then flush the holding cell.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] on an unexpected revocation or a secret
    /// that does not match.
    pub fn revoke_and_ack(&mut self, msg: &RevokeAndACK) -> Result<ChannelOutcome, ChannelError> {
        self.check_connected("revoke_and_ack")?;
        if !self.flags.awaiting_remote_revoke {
            return Err(ChannelError::close("received an unexpected revoke_and_ack"));
        }
        let secret = SecretKey::from_slice(&msg.per_commitment_secret)
            .map_err(|_| ChannelError::close("peer provided an invalid per commitment secret"))?;
        let expected = self
            .counterparty_cur_point
            .ok_or_else(|| ChannelError::close("counterparty current commitment point unknown"))?;
        if PublicKey::from_secret_key(&*SECP, &secret) != expected {
            return Err(ChannelError::close(
                "got a revoke commitment secret which didn't correspond to their current pubkey",
            ));
        }
        let idx = INITIAL_COMMITMENT_NUMBER - self.counterparty_tail_number;
        self.counterparty_secrets
            .provide_secret(idx, msg.per_commitment_secret)
            .map_err(|_| ChannelError::close("previous secrets did not match new one"))?;
        let mut steps = vec![ChannelMonitorUpdateStep::CommitmentSecret {
            idx,
            secret: msg.per_commitment_secret,
        }];

        self.counterparty_cur_point = self.counterparty_next_point;
        self.counterparty_next_point = Some(msg.next_per_commitment_point);
        self.remote_tail = self.remote_tip;
        self.counterparty_tail_number = self.counterparty_tip_number;
        self.flags.awaiting_remote_revoke = false;
        debug!(channel_id = %self.channel_id, revoked = self.counterparty_tail_number.saturating_sub(1), "peer revoked commitment");

        let (locked_in, resolved) = self.process_lock_ins();
        let mut outcome = ChannelOutcome::new(self.resend_order);
        outcome.resolved = resolved;
        if self.flags.monitor_update_in_progress {
            self.monitor_pending_locked_in.extend(locked_in);
            outcome.monitor_update = Some(self.new_monitor_update(steps));
            return Ok(outcome);
        }

        outcome.locked_in = locked_in;
        outcome.dropped = self.free_holding_cell();
        if let Some((update, step)) = self.send_commitment_no_state_check()? {
            steps.push(step);
            outcome.commitment_update = Some(update);
        }
        outcome.monitor_update = Some(self.new_monitor_update(steps));
        Ok(outcome)
    }

    /// Revoke our previous commitment, as sent after our latest one was
    /// signed
    fn get_last_revoke_and_ack(&self) -> Result<RevokeAndACK, ChannelError> {
        let current = self.holder_commitment_number;
        if current == 0 {
            return Err(ChannelError::close("no commitment to revoke yet"));
        }
        Ok(RevokeAndACK {
            channel_id: self.channel_id,
            per_commitment_secret: self.keys.commitment_secret(INITIAL_COMMITMENT_NUMBER - (current - 1)),
            next_per_commitment_point: self.holder_point(current + 1)?,
        })
    }

    /// Rebuild the batch and signature for the counterparty's latest
    /// commitment
    fn get_last_commitment_update(&self) -> Result<CommitmentUpdate, ChannelError> {
        let point = self
            .counterparty_next_point
            .ok_or_else(|| ChannelError::close("counterparty next commitment point unknown"))?;
        let keys = self.counterparty_tx_keys(&point)?;
        let built = self.build_commitment(false, self.remote_tip, self.counterparty_tip_number, keys)?;
        let (signature, htlc_signatures) = self.sign_counterparty_commitment(&built)?;
        Ok(self.build_commitment_update(
            self.remote_tail.ours,
            self.remote_tip.ours,
            CommitmentSigned {
                channel_id: self.channel_id,
                signature,
                htlc_signatures,
            },
        ))
    }

    // ============ Lock-in ============

    fn process_lock_ins(&mut self) -> (Vec<LockedInHTLC>, Vec<ResolvedHTLC>) {
        let ours_end = self.holder_tip.ours.min(self.remote_tail.ours);
        let theirs_end = self.holder_tip.theirs.min(self.remote_tail.theirs);

        for entry in self
            .local_log
            .iter_mut()
            .filter(|e| e.log_index < ours_end && !e.locked)
        {
            entry.locked = true;
        }

        let mut locked_in = Vec::new();
        let mut failed = Vec::new();
        for entry in self
            .remote_log
            .iter_mut()
            .filter(|e| e.log_index < theirs_end && !e.locked)
        {
            entry.locked = true;
            match &mut entry.update {
                LogUpdate::Add {
                    htlc_id,
                    amount_msat,
                    cltv_expiry,
                    pending,
                    ..
                } => {
                    if let Some(status) = pending.take() {
                        locked_in.push(LockedInHTLC {
                            htlc_id: *htlc_id,
                            amount_msat: *amount_msat,
                            cltv_expiry: *cltv_expiry,
                            status,
                        });
                    }
                }
                LogUpdate::Fail { htlc_id, reason, .. } => failed.push((*htlc_id, reason.take())),
                _ => {}
            }
        }

        let mut resolved = Vec::with_capacity(failed.len());
        for (htlc_id, reason) in failed {
            if let Some(LogUpdate::Add {
                payment_hash,
                source: Some(source),
                ..
            }) = self.local_log.find_add(htlc_id).map(|e| &e.update)
            {
                resolved.push(ResolvedHTLC::Failed {
                    source: source.clone(),
                    payment_hash: *payment_hash,
                    reason: reason.unwrap_or_else(|| HTLCFailReason::reason(TEMPORARY_CHANNEL_FAILURE, Vec::new())),
                });
            }
        }

        self.fold_resolved(ours_end, theirs_end);
        (locked_in, resolved)
    }

    /// Move HTLCs whose add and removal are both locked in into the base
    /// balances, and locked fee changes into the base fee rate
    fn fold_resolved(&mut self, ours_end: u64, theirs_end: u64) {
        let mut our_folds = Vec::new();
        for entry in self.local_log.included(ours_end) {
            if let LogUpdate::Add { htlc_id, amount_msat, .. } = entry.update {
                if let Some(removal) = self.remote_log.find_removal(htlc_id).filter(|r| r.log_index < theirs_end) {
                    our_folds.push((htlc_id, matches!(removal.update, LogUpdate::Fulfill { .. }), amount_msat));
                }
            }
        }
        let mut their_folds = Vec::new();
        for entry in self.remote_log.included(theirs_end) {
            if let LogUpdate::Add { htlc_id, amount_msat, .. } = entry.update {
                if let Some(removal) = self.local_log.find_removal(htlc_id).filter(|r| r.log_index < ours_end) {
                    their_folds.push((htlc_id, matches!(removal.update, LogUpdate::Fulfill { .. }), amount_msat));
                }
            }
        }

        for &(_, fulfilled, amount) in &our_folds {
            if fulfilled {
                self.base_local_msat = self.base_local_msat.saturating_sub(amount);
                self.base_remote_msat += amount;
            }
        }
        for &(_, fulfilled, amount) in &their_folds {
            if fulfilled {
                self.base_remote_msat = self.base_remote_msat.saturating_sub(amount);
                self.base_local_msat += amount;
            }
        }
        for entry in self
            .local_log
            .included(ours_end)
            .chain(self.remote_log.included(theirs_end))
        {
            if let LogUpdate::Fee { feerate_per_kw } = entry.update {
                self.feerate_per_kw = feerate_per_kw;
            }
        }

        let our_ids: Vec<u64> = our_folds.iter().map(|f| f.0).collect();
        let their_ids: Vec<u64> = their_folds.iter().map(|f| f.0).collect();
        self.local_log.remove_where(|e| match e.update {
            LogUpdate::Add { htlc_id, .. } => our_ids.contains(&htlc_id),
            LogUpdate::Fulfill { htlc_id, .. } | LogUpdate::Fail { htlc_id, .. } => their_ids.contains(&htlc_id),
            LogUpdate::Fee { .. } => e.log_index < ours_end,
        });
        self.remote_log.remove_where(|e| match e.update {
            LogUpdate::Add { htlc_id, .. } => their_ids.contains(&htlc_id),
            LogUpdate::Fulfill { htlc_id, .. } | LogUpdate::Fail { htlc_id, .. } => our_ids.contains(&htlc_id),
            LogUpdate::Fee { .. } => e.log_index < theirs_end,
        });
        if !our_ids.is_empty() || !their_ids.is_empty() {
            trace!(
                channel_id = %self.channel_id,
                ours = our_ids.len(),
                theirs = their_ids.len(),
                "folded resolved HTLCs into balances"
            );
        }
    }

    // ============ Holding Cell ============

    fn free_holding_cell(&mut self) -> Vec<DroppedHTLC> {
        let held = std::mem::take(&mut self.holding_cell);
        if held.is_empty() {
            return Vec::new();
        }
        debug!(channel_id = %self.channel_id, updates = held.len(), "freeing holding cell");
        let mut dropped = Vec::new();
        for update in held {
            match update {
                HoldingCellUpdate::AddHTLC {
                    amount_msat,
                    payment_hash,
                    cltv_expiry,
                    source,
                    onion,
                } => {
                    let check = if self.is_usable() {
                        self.validate_outbound_add(amount_msat)
                    } else {
                        Err(ChannelError::ignore("channel is shutting down"))
                    };
                    match check {
                        Ok(()) => self.push_local_add(amount_msat, payment_hash, cltv_expiry, source, onion),
                        Err(err) => {
                            debug!(channel_id = %self.channel_id, %payment_hash, error = %err, "dropping held HTLC");
                            dropped.push(DroppedHTLC {
                                source,
                                payment_hash,
                                channel_id: self.channel_id,
                            });
                        }
                    }
                }
                HoldingCellUpdate::ClaimHTLC { htlc_id, preimage } => {
                    if self.remote_log.find_add(htlc_id).is_some() && self.local_log.find_removal(htlc_id).is_none() {
                        self.local_log.push(LogUpdate::Fulfill { htlc_id, preimage });
                    }
                }
                HoldingCellUpdate::FailHTLC { htlc_id, payload } => {
                    if self.remote_log.find_add(htlc_id).is_some() && self.local_log.find_removal(htlc_id).is_none() {
                        self.local_log.push(LogUpdate::Fail {
                            htlc_id,
                            payload: Some(payload),
                            reason: None,
                        });
                    }
                }
                HoldingCellUpdate::UpdateFee { feerate_per_kw } => {
                    if self.is_outbound {
                        self.push_local_fee(feerate_per_kw);
                    }
                }
            }
        }
        dropped
    }

    /// Flush the holding cell into a new commitment when allowed
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the commitment cannot be signed.
    pub fn maybe_free_holding_cell(
        &mut self,
    ) -> Result<(Option<(CommitmentUpdate, ChannelMonitorUpdate)>, Vec<DroppedHTLC>), ChannelError> {
        if !self.state.is_operational() || !self.can_generate_new_commitment() || self.holding_cell.is_empty() {
            return Ok((None, Vec::new()));
        }
        let dropped = self.free_holding_cell();
        Ok((self.send_commitment()?, dropped))
    }

    // ============ Monitor Failures ============

    /// The monitor update returned with the last outcome could not be
    /// persisted. The channel freezes and the messages that were dropped
    /// are regenerated by [`Channel::monitor_updating_restored`].
    pub fn monitor_update_failed(&mut self, resend_raa: bool, resend_commitment: bool, locked_in: Vec<LockedInHTLC>) {
        warn!(channel_id = %self.channel_id, resend_raa, resend_commitment, "monitor update failed, freezing channel");
        self.flags.monitor_update_in_progress = true;
        self.monitor_pending_revoke_and_ack |= resend_raa;
        self.monitor_pending_commitment_signed |= resend_commitment;
        self.monitor_pending_locked_in.extend(locked_in);
    }

    /// Every monitor update has been persisted: unfreeze and regenerate
    /// what was withheld.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if a withheld message cannot be rebuilt.
    pub fn monitor_updating_restored(&mut self) -> Result<ChannelOutcome, ChannelError> {
        self.flags.monitor_update_in_progress = false;
        let mut outcome = ChannelOutcome::new(self.resend_order);
        outcome.locked_in = std::mem::take(&mut self.monitor_pending_locked_in);
        let resend_raa = std::mem::take(&mut self.monitor_pending_revoke_and_ack);
        let resend_commitment = std::mem::take(&mut self.monitor_pending_commitment_signed);
        if self.flags.peer_disconnected {
            return Ok(outcome);
        }
        if resend_raa {
            outcome.revoke_and_ack = Some(self.get_last_revoke_and_ack()?);
        }
        if resend_commitment {
            outcome.commitment_update = Some(self.get_last_commitment_update()?);
        } else if self.state.is_operational() && !self.flags.awaiting_remote_revoke {
            outcome.dropped = self.free_holding_cell();
            if let Some((update, step)) = self.send_commitment_no_state_check()? {
                outcome.commitment_update = Some(update);
                outcome.monitor_update = Some(self.new_monitor_update(vec![step]));
                outcome.order = RAACommitmentOrder::RevokeAndACKFirst;
            }
        }
        debug!(channel_id = %self.channel_id, resend_raa, resend_commitment, "monitor restored, unfreezing channel");
        Ok(outcome)
    }

    // ============ Reconnection ============

    /// The peer disconnected: forget their uncommitted updates and park
    /// ours in the holding cell for retransmission.
    pub fn remove_uncommitted_htlcs_and_mark_paused(&mut self) {
        if !self.state.is_funded() || self.state == ChannelState::Closed || self.flags.peer_disconnected {
            return;
        }
        for entry in self.remote_log.truncate(self.holder_tip.theirs) {
            if let LogUpdate::Add { htlc_id, .. } = entry.update {
                self.next_counterparty_htlc_id = self.next_counterparty_htlc_id.min(htlc_id);
            }
        }

        let mut requeued = Vec::new();
        for entry in self.local_log.truncate(self.remote_tip.ours) {
            match entry.update {
                LogUpdate::Add {
                    htlc_id,
                    amount_msat,
                    payment_hash,
                    cltv_expiry,
                    onion: Some(onion),
                    source: Some(source),
                    ..
                } => {
                    self.next_holder_htlc_id = self.next_holder_htlc_id.min(htlc_id);
                    requeued.push(HoldingCellUpdate::AddHTLC {
                        amount_msat,
                        payment_hash,
                        cltv_expiry,
                        source,
                        onion,
                    });
                }
                LogUpdate::Fulfill { htlc_id, preimage } => {
                    requeued.push(HoldingCellUpdate::ClaimHTLC { htlc_id, preimage });
                }
                LogUpdate::Fail {
                    htlc_id,
                    payload: Some(payload),
                    ..
                } => requeued.push(HoldingCellUpdate::FailHTLC { htlc_id, payload }),
                LogUpdate::Fee { feerate_per_kw } => requeued.push(HoldingCellUpdate::UpdateFee { feerate_per_kw }),
                _ => {}
            }
        }
        requeued.append(&mut self.holding_cell);
        self.holding_cell = requeued;
        self.flags.peer_disconnected = true;
        self.announcement_sigs_sent = false;
        debug!(channel_id = %self.channel_id, held = self.holding_cell.len(), "peer disconnected, channel paused");
    }

    /// Our `channel_reestablish` for a fresh connection
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if our own point cannot be derived.
    pub fn get_channel_reestablish(&self) -> Result<ChannelReestablish, ChannelError> {
        let tail = self.counterparty_tail_number;
        let your_last_per_commitment_secret = if tail == 0 {
            [0; 32]
        } else {
            self.counterparty_secrets
                .get_secret(INITIAL_COMMITMENT_NUMBER - (tail - 1))
                .unwrap_or([0; 32])
        };
        Ok(ChannelReestablish {
            channel_id: self.channel_id,
            next_local_commitment_number: self.holder_commitment_number + 1,
            next_remote_commitment_number: tail,
            your_last_per_commitment_secret,
            my_current_per_commitment_point: self.holder_point(self.holder_commitment_number)?,
        })
    }

    /// Handle the peer's `channel_reestablish`, working out what it missed.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the peer's state is irreconcilable with
    /// ours.
    pub fn channel_reestablish(&mut self, msg: &ChannelReestablish) -> Result<ChannelOutcome, ChannelError> {
        if !self.flags.peer_disconnected {
            return Err(ChannelError::close("peer sent a loose channel_reestablish not after reconnect"));
        }
        let holder = self.holder_commitment_number;
        let next_revoke = msg.next_remote_commitment_number;
        if next_revoke > holder {
            return Err(ChannelError::close("peer claims we revoked a commitment we never had"));
        }
        if next_revoke > 0 {
            let expected = self.keys.commitment_secret(INITIAL_COMMITMENT_NUMBER - (next_revoke - 1));
            if msg.your_last_per_commitment_secret != expected {
                return Err(ChannelError::close("peer sent a garbage channel_reestablish"));
            }
        }
        let resend_raa = if next_revoke + 1 == holder {
            true
        } else if next_revoke == holder {
            false
        } else {
            return Err(ChannelError::close(
                "peer attempted to reestablish with a very old local commitment transaction",
            ));
        };

        let next_local = msg.next_local_commitment_number;
        let tip = self.counterparty_tip_number;
        let resend_commitment = if next_local == tip + 1 {
            false
        } else if next_local == tip && self.flags.awaiting_remote_revoke {
            true
        } else {
            return Err(ChannelError::close(
                "peer attempted to reestablish with a very old remote commitment transaction",
            ));
        };

        self.flags.peer_disconnected = false;
        let mut outcome = ChannelOutcome::new(self.resend_order);
        if self.flags.our_funding_locked && next_local == 1 && next_revoke == 0 {
            outcome.funding_locked = Some(self.get_funding_locked()?);
        }
        if self.flags.local_shutdown_sent {
            outcome.shutdown = Some(self.shutdown_msg());
        }
        if self.flags.monitor_update_in_progress {
            self.monitor_pending_revoke_and_ack |= resend_raa;
            self.monitor_pending_commitment_signed |= resend_commitment;
            return Ok(outcome);
        }

        if resend_raa {
            outcome.revoke_and_ack = Some(self.get_last_revoke_and_ack()?);
        }
        if resend_commitment {
            outcome.commitment_update = Some(self.get_last_commitment_update()?);
        } else if self.state.is_operational() && !self.flags.awaiting_remote_revoke {
            outcome.dropped = self.free_holding_cell();
            if let Some((update, step)) = self.send_commitment_no_state_check()? {
                outcome.commitment_update = Some(update);
                outcome.monitor_update = Some(self.new_monitor_update(vec![step]));
                outcome.order = RAACommitmentOrder::RevokeAndACKFirst;
            }
        }
        debug!(
            channel_id = %self.channel_id,
            resend_raa,
            resend_commitment,
            "channel reestablished"
        );
        Ok(outcome)
    }
}
