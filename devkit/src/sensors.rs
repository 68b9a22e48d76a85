/*!
Capteurs déterministes pour les tests de session
*/

use sensorlink_node::SensorSource;
use sensorlink_protocol::Reading;

/// Renvoie toujours la même lecture
pub struct StaticSensor(pub Reading);

impl StaticSensor {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self(Reading::new(temperature, humidity))
    }
}

impl SensorSource for StaticSensor {
    fn next_reading(&mut self) -> Reading {
        self.0
    }
}

/// Rejoue une séquence de lectures en boucle
pub struct SequenceSensor {
    readings: Vec<Reading>,
    next: usize,
}

impl SequenceSensor {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self { readings, next: 0 }
    }
}

impl SensorSource for SequenceSensor {
    fn next_reading(&mut self) -> Reading {
        let Some(reading) = self.readings.get(self.next % self.readings.len().max(1)).copied() else {
            return Reading::new(20.0, 50.0);
        };
        self.next += 1;
        reading
    }
}
