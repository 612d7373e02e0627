/*! The logic-fabric interface.

Everything below the sample stream is somebody else's problem: the fabric
demodulates, thresholds, and hands the core one 8-bit sample byte per bit
period, plus a free-running tick counter at the subcarrier clock, an ADC
channel for field sensing, and a transmit hold register. The core only
ever polls; nothing here blocks.
*/

/// Major/minor mode of the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FabricMode {
    /// Carrier off, nothing demodulated.
    #[default]
    Off,
    /// Reader transmitting: symbol bytes drive the pause modulator.
    ReaderModulating,
    /// Reader receiving: subcarrier samples of the tag answer.
    ReaderListening,
    /// Tag receiving: pause samples of the reader command.
    TagListening,
    /// Tag transmitting: symbol bytes drive load modulation.
    TagModulating,
    /// Both directions demodulated into one stream.
    Sniffer,
}

/// Advisory indicator LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    /// Mode indicator.
    A,
    /// Tag activity.
    B,
    /// Reader activity.
    C,
    /// Error/attention.
    D,
}

/// What the protocol core needs from the radio front end.
///
/// Implementations: the real SPI-attached gate array, and
/// [`crate::sim::SimFabric`] for tests.
pub trait Fabric {
    /// Select the front-end mode. Leaving a mode always goes through
    /// [`FabricMode::Off`].
    fn set_mode(&mut self, mode: FabricMode);

    /// A received sample byte is waiting.
    fn rx_ready(&mut self) -> bool;

    /// Take the pending sample byte. Only valid after [`Self::rx_ready`].
    fn rx(&mut self) -> u8;

    /// The transmit hold register can take another symbol byte.
    fn tx_ready(&mut self) -> bool;

    /// Write one symbol byte to the transmit hold register.
    fn tx(&mut self, symbol: u8);

    /// True once the fabric-side send queue has drained. The emulated tag
    /// must not switch back to listening before this.
    fn tx_queue_empty(&mut self) -> bool {
        true
    }

    /// Current depth of the fabric send queue, in half-samples. Part of
    /// the tag-side transmit delay.
    fn send_queue_delay(&self) -> u32 {
        0
    }

    /// Free-running tick counter at the subcarrier clock (≈ fc/16).
    fn tick(&mut self) -> u32;

    /// Raw field-strength ADC reading.
    fn field_adc(&mut self) -> u16;

    /// Drive one LED. Advisory only.
    fn led(&mut self, _led: Led, _on: bool) {}

    /// All LEDs off.
    fn leds_off(&mut self) {
        for led in [Led::A, Led::B, Led::C, Led::D] {
            self.led(led, false);
        }
    }

    /// Operator cancel button.
    fn button_pressed(&mut self) -> bool {
        false
    }

    /// Pet the watchdog. Called at every suspension point.
    fn kick_watchdog(&mut self) {}
}
