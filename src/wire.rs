use crate::Error;

/// Preferred payload chunk size, in bytes, sent with every data request.
pub const CHUNK_SIZE: u32 = 80_000;

/*
                     Instrument access-window protocol

    client                                server
      |                                      |
      |--- Connect(name) ------------------->|  register client
      |--- WaitForDataAccess(name) --------->|  blocks ...
      |                                      |  (acquisition completes,
      |                                      |   server yields datastore)
      |<-------------------------------- ok--|  window OPEN, scope holds
      |--- GetHeader(source, chunksize) ---->|
      |<------------------------- header ----|      (per active source)
      |--- GetWaveform(source, chunksize) -->|
      |<----------------- chunk, chunk, ... -|      (per accepted source)
      |--- FinishedWithDataAccess(name) ---->|  window CLOSED, scope
      |                                      |  resumes acquiring
      v                                      v

The server stops acquiring for as long as a window is open, so the client
must hold it only for the duration of one fetch. RequestNewSequence asks the
server to produce a fresh window promptly even if no new acquisition has
completed, which is how a client unblocks itself against a stopped scope.
*/

/// Per-source, per-acquisition description of one waveform.
///
/// Field names follow the server's wire names; where the wire name is not
/// valid Rust style, the wire spelling is noted on the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformHeader {
    pub sourcename: String,
    /// Monotonic per-server acquisition id.
    pub dataid: u64,
    pub hasdata: bool,
    pub noofsamples: u64,
    /// Bytes per stored sample element. Valid values are 1, 2 and 4.
    pub sourcewidth: u32,
    /// Waveform family tag: 1..=3 analog vector, 4..=5 digital bus,
    /// 6..=7 analog IQ.
    pub wfmtype: i32,
    pub pairtype: i32,
    pub verticalspacing: f64,
    pub verticaloffset: f64,
    pub verticalunits: String,
    pub horizontalspacing: f64,
    /// Wire name: `horizontalUnits`.
    pub horizontal_units: String,
    pub horizontalzeroindex: f64,
    /// Wire name: `iq_centerFrequency`.
    pub iq_center_frequency: f64,
    /// Wire name: `iq_fftLength`.
    pub iq_fft_length: f64,
    pub iq_rbw: f64,
    pub iq_span: f64,
    /// Wire name: `iq_windowType`.
    pub iq_window_type: String,
}

impl WaveformHeader {
    /// A header takes part in filtering and payload reads only when it
    /// carries data, a positive sample count and a supported width.
    pub fn is_valid(&self) -> bool {
        self.hasdata && self.noofsamples > 0 && matches!(self.sourcewidth, 1 | 2 | 4)
    }

    /// Total payload size implied by this header, in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.noofsamples as usize * self.sourcewidth as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformRequest {
    pub sourcename: String,
    pub chunksize: u32,
}

impl WaveformRequest {
    pub fn new(sourcename: &str) -> Self {
        WaveformRequest {
            sourcename: sourcename.to_string(),
            chunksize: CHUNK_SIZE,
        }
    }
}

/// Ordered stream of raw payload chunks for one source. Concatenated, the
/// chunks hold exactly `noofsamples * sourcewidth` little-endian bytes.
pub type ChunkStream = Box<dyn Iterator<Item = Result<Vec<u8>, Error>> + Send>;

/// Connection-control service of the instrument channel.
pub trait ConnectService: Send + Sync {
    fn connect(&self, name: &str) -> Result<(), Error>;

    /// Deregisters the client and releases any window it still holds.
    fn disconnect(&self, name: &str) -> Result<(), Error>;

    fn request_available_names(&self, name: &str) -> Result<Vec<String>, Error>;

    /// Asks the server to produce a fresh access window promptly.
    fn request_new_sequence(&self, name: &str) -> Result<(), Error>;

    /// Blocks until the server yields the datastore to this client.
    fn wait_for_data_access(&self, name: &str) -> Result<(), Error>;

    /// Returns the datastore so the server may resume acquiring.
    fn finished_with_data_access(&self, name: &str) -> Result<(), Error>;
}

/// Byte-exact instrument data service.
///
/// `get_header` replies with an empty header (`hasdata == false`) for
/// sources the server does not currently expose.
pub trait NativeDataService: Send + Sync {
    fn get_header(&self, request: &WaveformRequest) -> Result<WaveformHeader, Error>;

    fn get_waveform(&self, request: &WaveformRequest) -> Result<ChunkStream, Error>;
}

/// One dialed channel to the instrument, carrying both services. A channel
/// may expose further services (e.g. normalized float data); this client
/// never calls them.
pub trait ScopeChannel: ConnectService + NativeDataService {}

impl<T: ConnectService + NativeDataService> ScopeChannel for T {}
