// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The far-memory server: the authoritative object store plus the TCP
//! request loop. The first accepted connection is the control connection
//! (Init and Shutdown); every later one gets its own dispatcher thread
//! running the per-opcode loop until the peer hangs up.

pub mod ds;

use std::collections::HashMap;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;

use crate::prelude::*;
use crate::protocol::Framed;
use crate::protocol::MAX_CALL_BODY_LEN;
use crate::protocol::MAX_OBJECT_DATA_LEN;
use crate::protocol::OpCode;
use crate::protocol::read_bytes;
use crate::rpc::Buffer;
use crate::rpc::RpcReply;
use crate::rpc::Serializer;
use crate::server::ds::ServerDs;
use crate::utils::MemoryReservation;

/// The authoritative store: a ds_id -> instance map plus the far-memory
/// reservation made at Init. Shared by every connection thread, and used
/// in-process by the fake device.
#[derive(Default)]
pub struct ServerStore {
    instances: RwLock<HashMap<u8, Arc<Mutex<ServerDs>>>>,
    reservation: Mutex<Option<MemoryReservation>>,
}

impl ServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the far-memory region, hugepage-rounded.
    pub fn init(&self, far_mem_size: u64) -> Result<()> {
        let reservation = MemoryReservation::reserve(far_mem_size).location(loc!())?;
        info!(
            "reserved {} bytes of far memory (hugepages: {})",
            reservation.len(),
            reservation.hugepage_backed()
        );
        *self.reservation.lock().unwrap() = Some(reservation);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.instances.write().unwrap().clear();
        *self.reservation.lock().unwrap() = None;
    }

    pub fn construct(&self, ds_type: u8, ds_id: u8, params: &[u8]) -> Result<()> {
        let instance = ServerDs::build(ds_type, params).location(loc!())?;
        let mut instances = self.instances.write().unwrap();
        ensure!(
            !instances.contains_key(&ds_id),
            "ds_id {ds_id} already constructed"
        );
        instances.insert(ds_id, Arc::new(Mutex::new(instance)));
        debug!("constructed ds {ds_id} of type {ds_type}");
        Ok(())
    }

    pub fn destruct(&self, ds_id: u8) -> Result<()> {
        self.instances
            .write()
            .unwrap()
            .remove(&ds_id)
            .with_context(loc!(), || format!("destruct of unknown ds_id {ds_id}"))?;
        debug!("destructed ds {ds_id}");
        Ok(())
    }

    fn instance(&self, ds_id: u8) -> Result<Arc<Mutex<ServerDs>>> {
        self.instances
            .read()
            .unwrap()
            .get(&ds_id)
            .cloned()
            .with_context(loc!(), || format!("unknown ds_id {ds_id}"))
    }

    pub fn read_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<Vec<u8>> {
        let instance = self.instance(ds_id).location(loc!())?;
        let data = instance.lock().unwrap().read_object(obj_id).location(loc!())?;
        ensure!(
            data.len() <= MAX_OBJECT_DATA_LEN,
            "object of {} bytes exceeds the wire limit",
            data.len()
        );
        Ok(data)
    }

    pub fn write_object(&self, ds_id: u8, obj_id: &[u8], data: &[u8]) -> Result<()> {
        ensure!(
            data.len() <= MAX_OBJECT_DATA_LEN,
            "write of {} bytes exceeds the wire limit",
            data.len()
        );
        let instance = self.instance(ds_id).location(loc!())?;
        let result = instance.lock().unwrap().write_object(obj_id, data);
        result.location(loc!())
    }

    pub fn remove_object(&self, ds_id: u8, obj_id: &[u8]) -> Result<bool> {
        let instance = self.instance(ds_id).location(loc!())?;
        let result = instance.lock().unwrap().remove_object(obj_id);
        result.location(loc!())
    }

    pub fn compute(&self, ds_id: u8, opcode: u8, input: &[u8]) -> Result<Vec<u8>> {
        let instance = self.instance(ds_id).location(loc!())?;
        let result = instance.lock().unwrap().compute(opcode, input);
        result.location(loc!())
    }

    pub fn call(&self, ds_id: u8, method: &str, args: Buffer) -> Result<RpcReply> {
        let instance = self.instance(ds_id).location(loc!())?;
        let result = instance.lock().unwrap().call(method, args);
        result.location(loc!())
    }

    pub fn ds_count(&self) -> usize {
        self.instances.read().unwrap().len()
    }
}

/// Runs the accept loop until a client drives the Shutdown opcode. Returns
/// once every dispatcher thread has drained.
pub fn serve(listener: TcpListener) -> Result<()> {
    let store = Arc::new(ServerStore::new());
    serve_with_store(listener, store)
}

pub fn serve_with_store(listener: TcpListener, store: Arc<ServerStore>) -> Result<()> {
    let local_addr = listener.local_addr().location(loc!())?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut master: Option<thread::JoinHandle<()>> = None;
    let mut slaves = Vec::new();

    info!("far-memory server listening on {local_addr}");
    loop {
        let (stream, peer) = listener.accept().location(loc!())?;
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        stream.set_nodelay(true).location(loc!())?;
        if master.is_none() {
            debug!("control connection from {peer}");
            let store = store.clone();
            let shutdown = shutdown.clone();
            master = Some(thread::spawn(move || {
                if let Err(e) = handle_master(stream, &store, &shutdown, local_addr) {
                    error!("control connection failed: {e:?}");
                }
            }));
        } else {
            trace!("request connection from {peer}");
            let store = store.clone();
            slaves.push(thread::spawn(move || {
                handle_slave(stream, &store);
            }));
        }
    }

    for slave in slaves {
        let _ = slave.join();
    }
    if let Some(master) = master {
        let _ = master.join();
    }
    info!("far-memory server shut down");
    Ok(())
}

/// The control connection speaks exactly Init then Shutdown.
fn handle_master(
    mut stream: TcpStream,
    store: &ServerStore,
    shutdown: &AtomicBool,
    local_addr: std::net::SocketAddr,
) -> Result<()> {
    let opcode = OpCode::framed_read(&mut stream).location(loc!())?;
    ensure!(
        opcode == OpCode::Init,
        "control connection opened with {opcode:?} instead of Init"
    );
    let far_mem_size = u64::framed_read(&mut stream).location(loc!())?;
    store.init(far_mem_size).location(loc!())?;
    1u8.framed_write(&mut stream).location(loc!())?;

    let opcode = OpCode::framed_read(&mut stream).location(loc!())?;
    ensure!(
        opcode == OpCode::Shutdown,
        "control connection sent {opcode:?}, only Shutdown is valid here"
    );
    store.shutdown();
    shutdown.store(true, Ordering::Release);
    1u8.framed_write(&mut stream).location(loc!())?;

    // Kick the accept loop so it observes the shutdown flag.
    let _ = TcpStream::connect(local_addr);
    Ok(())
}

/// Per-connection dispatch loop. A malformed request is a protocol
/// violation: the error propagates and the connection dies with it.
fn handle_slave(mut stream: TcpStream, store: &ServerStore) {
    loop {
        let mut opcode_byte = [0u8; 1];
        match std::io::Read::read(&mut stream, &mut opcode_byte) {
            Ok(0) => {
                trace!("request connection closed by peer");
                return;
            },
            Ok(_) => {},
            Err(e) => {
                debug!("request connection read failed: {e}");
                return;
            },
        }
        let opcode = log_and_return!(OpCode::try_from(opcode_byte[0]).location(loc!()));
        log_and_return!(dispatch(&mut stream, store, opcode).location(loc!()));
    }
}

fn dispatch(stream: &mut TcpStream, store: &ServerStore, opcode: OpCode) -> Result<()> {
    match opcode {
        OpCode::ReadObject => process_read_object(stream, store),
        OpCode::WriteObject => process_write_object(stream, store),
        OpCode::RemoveObject => process_remove_object(stream, store),
        OpCode::Construct => process_construct(stream, store),
        OpCode::Destruct => process_destruct(stream, store),
        OpCode::Compute => process_compute(stream, store),
        OpCode::Call => process_call(stream, store),
        OpCode::Init | OpCode::Shutdown => {
            bail!("{opcode:?} is only valid on the control connection")
        },
    }
}

fn read_obj_id(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let ds_id = u8::framed_read(stream).location(loc!())?;
    let obj_id_len = u8::framed_read(stream).location(loc!())?;
    let obj_id = read_bytes(stream, obj_id_len as usize).location(loc!())?;
    Ok((ds_id, obj_id))
}

fn process_read_object(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let (ds_id, obj_id) = read_obj_id(stream).location(loc!())?;
    let data = store.read_object(ds_id, &obj_id).location(loc!())?;
    (data.len() as u16).framed_write(stream).location(loc!())?;
    std::io::Write::write_all(stream, &data).location(loc!())
}

fn process_write_object(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let ds_id = u8::framed_read(stream).location(loc!())?;
    let obj_id_len = u8::framed_read(stream).location(loc!())?;
    let data_len = u16::framed_read(stream).location(loc!())?;
    let obj_id = read_bytes(stream, obj_id_len as usize).location(loc!())?;
    let data = read_bytes(stream, data_len as usize).location(loc!())?;
    store.write_object(ds_id, &obj_id, &data).location(loc!())?;
    1u8.framed_write(stream).location(loc!())
}

fn process_remove_object(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let (ds_id, obj_id) = read_obj_id(stream).location(loc!())?;
    let exists = store.remove_object(ds_id, &obj_id).location(loc!())?;
    (exists as u8).framed_write(stream).location(loc!())
}

fn process_construct(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let ds_type = u8::framed_read(stream).location(loc!())?;
    let ds_id = u8::framed_read(stream).location(loc!())?;
    let param_len = u8::framed_read(stream).location(loc!())?;
    let params = read_bytes(stream, param_len as usize).location(loc!())?;
    store.construct(ds_type, ds_id, &params).location(loc!())?;
    1u8.framed_write(stream).location(loc!())
}

fn process_destruct(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let ds_id = u8::framed_read(stream).location(loc!())?;
    store.destruct(ds_id).location(loc!())?;
    1u8.framed_write(stream).location(loc!())
}

fn process_compute(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let ds_id = u8::framed_read(stream).location(loc!())?;
    let opcode = u8::framed_read(stream).location(loc!())?;
    let input_len = u16::framed_read(stream).location(loc!())?;
    let input = read_bytes(stream, input_len as usize).location(loc!())?;
    let output = store.compute(ds_id, opcode, &input).location(loc!())?;
    (output.len() as u16).framed_write(stream).location(loc!())?;
    std::io::Write::write_all(stream, &output).location(loc!())
}

fn process_call(stream: &mut TcpStream, store: &ServerStore) -> Result<()> {
    let ds_id = u8::framed_read(stream).location(loc!())?;
    let body_len = u16::framed_read(stream).location(loc!())?;
    let body = read_bytes(stream, body_len as usize).location(loc!())?;

    let mut body = Serializer::from(Buffer::from_bytes(&body));
    let method: String = body.read().location(loc!())?;
    let args = body.into_buffer();

    let reply = store.call(ds_id, &method, args).location(loc!())?;
    let mut out = Serializer::new();
    out.write(&reply);
    let payload = out.into_buffer();
    ensure!(
        payload.readable_bytes() <= MAX_CALL_BODY_LEN,
        "call reply of {} bytes exceeds the wire limit",
        payload.readable_bytes()
    );
    (payload.readable_bytes() as u16)
        .framed_write(stream)
        .location(loc!())?;
    std::io::Write::write_all(stream, payload.readable()).location(loc!())
}
