//! Driver tuning knobs.

/// Compile-time driver configuration, threaded through the driver as a
/// `PhantomData` parameter.
///
/// Token and busy waits are attempt-counted byte polls; each attempt
/// clocks one byte, so the default budgets correspond to the protocol's
/// millisecond budgets (100 ms data token, 500 ms programming) at the
/// 25 MHz operational rate. The power-up loop instead polls on a fixed
/// 1 ms interval against its 1 s budget.
pub trait SdSpiConfig {
    /// SPI clock during initialization; the card requires <= 400 kHz.
    const INIT_BAUD_HZ: u32 = 400_000;
    /// SPI clock after initialization completes.
    const FAST_BAUD_HZ: u32 = 25_000_000;

    /// Settle time after power-up before the first clocks, in
    /// microseconds. The card needs >= 1 ms; 10 ms leaves margin.
    const POWER_UP_DELAY_US: u16 = 10_000;
    /// GO_IDLE_STATE attempts during reset.
    const RESET_RETRIES: u32 = 10;
    /// Backoff between GO_IDLE_STATE attempts, in microseconds.
    const RESET_BACKOFF_US: u16 = 10_000;

    /// SD_SEND_OP_COND polls before giving up on power-up.
    const POWER_UP_ATTEMPTS: u32 = 1_000;
    /// Interval between SD_SEND_OP_COND polls, in microseconds.
    const POWER_UP_POLL_US: u16 = 1_000;

    /// Byte polls while waiting for a data start token (~100 ms).
    const READ_TOKEN_ATTEMPTS: u32 = 312_500;
    /// Byte polls while waiting for programming to finish (~500 ms).
    const BUSY_WAIT_ATTEMPTS: u32 = 1_562_500;

    /// Transparent retries of a single-block read that failed with a
    /// transient error. Multi-block transfers never retry internally.
    const READ_RETRIES: u32 = 3;
}

/// Stock configuration for the common 25 MHz-capable wiring.
pub struct DefaultSdSpiConfig;

impl SdSpiConfig for DefaultSdSpiConfig {}
