// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of acsedge.
//
// acsedge is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// acsedge is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with acsedge.  If not,
// see <http://www.gnu.org/licenses/>.

//! # acsedge
//!
//! A TR-069/CWMP session edge: the tier that faces the devices. CPEs POST their SOAP envelopes
//! to `/cwmp/{org}`; ingress pins each session to one worker with a sticky cookie; the worker
//! authenticates the device against its organization's cached credentials (or the zero-touch
//! bootstrap credential), runs the session conversation, & feeds it queued RPCs one per round
//! trip. Going the other way, the connection-request dispatcher nudges devices to check in,
//! under a global concurrency cap.
//!
//! Nothing here is the system of record: organizations arrive via bulk load + change feed
//! ([org_cache]), & sessions are ephemeral by design.

pub mod authn;
pub mod connreq;
pub mod cwmp;
pub mod dispatch;
pub mod entities;
pub mod ingress;
#[path = "org-cache.rs"]
pub mod org_cache;
pub mod session;
pub mod storage;
